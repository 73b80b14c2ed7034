//! Ingress validation. Runs before anything reaches the store.

use crate::config::ServiceConfig;
use crate::error::{LastPriceError, Result};
use crate::types::ProducerId;
use std::collections::HashSet;

/// Checks keys, payloads and producers against the service configuration.
#[derive(Clone, Debug)]
pub struct IngressValidator {
    max_key_len: usize,
    max_payload_bytes: usize,
    supported_instruments: Option<HashSet<String>>,
    authorized_producers: Option<HashSet<String>>,
}

impl IngressValidator {
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            max_key_len: config.max_key_len,
            max_payload_bytes: config.max_payload_bytes,
            supported_instruments: config
                .supported_instruments
                .as_ref()
                .map(|list| list.iter().cloned().collect()),
            authorized_producers: config
                .authorized_producers
                .as_ref()
                .map(|list| list.iter().cloned().collect()),
        }
    }

    /// Full check for a single publish.
    pub fn check_publish(&self, producer: &ProducerId, key: &str, payload: &[u8]) -> Result<()> {
        self.check_producer(producer)?;
        self.check_instrument(key)?;
        self.check_payload(payload)
    }

    /// Key must be well formed and, if configured, a supported instrument.
    pub fn check_instrument(&self, key: &str) -> Result<()> {
        if key.is_empty()
            || key.len() > self.max_key_len
            || !key.bytes().all(|b| b.is_ascii_graphic())
        {
            return Err(LastPriceError::MalformedKey(key.to_string()));
        }
        if let Some(supported) = &self.supported_instruments {
            if !supported.contains(key) {
                return Err(LastPriceError::WrongInstrument(key.to_string()));
            }
        }
        Ok(())
    }

    pub fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_payload_bytes {
            return Err(LastPriceError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    pub fn check_producer(&self, producer: &ProducerId) -> Result<()> {
        match &self.authorized_producers {
            Some(allowed) if !allowed.contains(&producer.0) => {
                Err(LastPriceError::UnauthorizedProducer(producer.0.clone()))
            }
            _ => Ok(()),
        }
    }
}
