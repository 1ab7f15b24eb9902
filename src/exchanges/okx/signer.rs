use crate::core::errors::ExchangeError;
use crate::core::kernel::{SignatureResult, Signer};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

pub struct OkxSigner {
    api_key: String,
    secret_key: String,
    passphrase: String,
    simulated_trading: bool,
}

impl OkxSigner {
    pub fn new(api_key: String, secret_key: String, passphrase: String) -> Self {
        Self {
            api_key,
            secret_key,
            passphrase,
            simulated_trading: false,
        }
    }

    /// Route signed requests to the demo trading environment
    pub fn with_simulated_trading(mut self, enabled: bool) -> Self {
        self.simulated_trading = enabled;
        self
    }

    /// Base64 HMAC-SHA256 over `timestamp + method + requestPath + body`
    fn generate_signature(
        &self,
        timestamp: &str,
        method: &str,
        request_path: &str,
        body: &str,
    ) -> Result<String, ExchangeError> {
        let prehash = format!("{}{}{}{}", timestamp, method, request_path, body);

        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::AuthError(format!("Failed to create HMAC: {}", e)))?;

        mac.update(prehash.as_bytes());
        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// ISO-8601 UTC with milliseconds, e.g. `2020-12-08T09:08:57.715Z`
    fn format_timestamp(timestamp_ms: u64) -> Result<String, ExchangeError> {
        let datetime = chrono::DateTime::from_timestamp_millis(timestamp_ms as i64)
            .ok_or_else(|| ExchangeError::AuthError("Invalid timestamp".to_string()))?;

        Ok(datetime.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
    }
}

impl Signer for OkxSigner {
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        timestamp: u64,
    ) -> SignatureResult {
        let timestamp = Self::format_timestamp(timestamp)?;

        // GET parameters are part of the signed path
        let request_path = if query_string.is_empty() {
            endpoint.to_string()
        } else {
            format!("{}?{}", endpoint, query_string)
        };

        let body_str = std::str::from_utf8(body)
            .map_err(|e| ExchangeError::AuthError(format!("Invalid body encoding: {}", e)))?;

        let signature = self.generate_signature(&timestamp, method, &request_path, body_str)?;

        let mut headers = HashMap::new();
        headers.insert("OK-ACCESS-KEY".to_string(), self.api_key.clone());
        headers.insert("OK-ACCESS-SIGN".to_string(), signature);
        headers.insert("OK-ACCESS-TIMESTAMP".to_string(), timestamp);
        headers.insert("OK-ACCESS-PASSPHRASE".to_string(), self.passphrase.clone());
        if self.simulated_trading {
            headers.insert("x-simulated-trading".to_string(), "1".to_string());
        }

        Ok((headers, Vec::new()))
    }
}
