//! Transaction dispatcher.
//!
//! Resolves configuration for a request, opens a secured channel, performs
//! one remote call and always releases the channel afterwards.

use crate::channel::{ChannelFactory, ChannelSettings, HttpChannelFactory, TransactionProcessor};
use crate::config::{ClientConfig, ClientSettings};
use crate::error::Result;
use crate::logger::{TracingLogger, TransactionLogger};
use crate::message::{to_loggable_xml, ReplyMessage, RequestMessage, REPLY_ROOT, REQUEST_ROOT};
use std::sync::Arc;
use tracing::{debug, info};

/// Client for the payment transaction service.
pub struct SoapClient<F = HttpChannelFactory> {
    settings: ClientSettings,
    factory: F,
    logger: Arc<dyn TransactionLogger>,
}

impl SoapClient<HttpChannelFactory> {
    /// Create a client dispatching over HTTPS.
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_factory(settings, HttpChannelFactory)
    }
}

impl<F: ChannelFactory> SoapClient<F> {
    /// Create a client using a custom channel factory.
    pub fn with_factory(settings: ClientSettings, factory: F) -> Self {
        Self {
            settings,
            factory,
            logger: Arc::new(TracingLogger),
        }
    }

    /// Replace the transaction logger.
    pub fn with_logger(mut self, logger: Arc<dyn TransactionLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Run a transaction with configuration derived from the settings.
    pub async fn run_transaction_default(
        &self,
        request: &mut RequestMessage,
    ) -> Result<ReplyMessage> {
        self.run_transaction(None, request).await
    }

    /// Run a transaction.
    ///
    /// Without an explicit `config`, one is built from the settings for the
    /// merchant named on the request. The request is stamped with the
    /// effective merchant ID and client metadata before it is sent.
    pub async fn run_transaction(
        &self,
        config: Option<&ClientConfig>,
        request: &mut RequestMessage,
    ) -> Result<ReplyMessage> {
        let resolved;
        let config = match config {
            Some(config) => config,
            None => {
                resolved = self
                    .settings
                    .configuration_for(request.merchant_id.as_deref())?;
                &resolved
            }
        };

        let merchant_id = determine_effective_merchant_id(config, request)?;
        request.stamp_client_metadata();

        let logger = self.prepare_log(config);

        let mut channel = match ChannelSettings::from_config(config, &merchant_id)
            .and_then(|settings| self.factory.create_channel(&settings))
        {
            Ok(channel) => channel,
            Err(e) => {
                if let Some(logger) = logger {
                    logger.log_exception(&e);
                }
                return Err(e);
            }
        };

        debug!(
            merchant_id = %merchant_id,
            reference = request.merchant_reference_code.as_deref().unwrap_or(""),
            "Dispatching transaction"
        );

        let outcome = invoke(&mut channel, config, request, logger).await;

        if let Err(ref e) = outcome {
            if let Some(logger) = logger {
                logger.log_exception(e);
            }
            channel.abort();
        }
        channel.close();

        if let Ok(ref reply) = outcome {
            info!(
                merchant_id = %merchant_id,
                decision = reply.decision.as_deref().unwrap_or(""),
                reason_code = reply.reason_code,
                "Transaction completed"
            );
        }

        outcome
    }

    fn prepare_log(&self, config: &ClientConfig) -> Option<&dyn TransactionLogger> {
        config.enable_log.then_some(self.logger.as_ref())
    }
}

async fn invoke<C: TransactionProcessor>(
    channel: &mut C,
    config: &ClientConfig,
    request: &RequestMessage,
    logger: Option<&dyn TransactionLogger>,
) -> Result<ReplyMessage> {
    if let Some(logger) = logger {
        if let Some(xml) = to_loggable_xml(request, REQUEST_ROOT) {
            logger.log_request(&xml, config.demo);
        }
    }

    let reply = channel.run_transaction(request).await?;

    if let Some(logger) = logger {
        if let Some(xml) = to_loggable_xml(&reply, REPLY_ROOT) {
            logger.log_reply(&xml, config.demo);
        }
    }

    Ok(reply)
}

/// Fill in the request's merchant ID from `config` when it is missing.
///
/// Returns the merchant ID the request will carry.
pub fn determine_effective_merchant_id(
    config: &ClientConfig,
    request: &mut RequestMessage,
) -> Result<String> {
    match request.merchant_id {
        Some(ref merchant_id) => Ok(merchant_id.clone()),
        None => {
            let merchant_id = config.non_null_merchant_id()?.to_string();
            request.merchant_id = Some(merchant_id.clone());
            Ok(merchant_id)
        }
    }
}
