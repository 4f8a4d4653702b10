use crate::error::AppError;
use crate::twilio_types::CallDetails;

use std::collections::HashMap;
use tracing::{debug, error};

const TWILIO_API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Minimal client for the Twilio Calls REST resource.
#[derive(Clone)]
pub struct TwilioApi {
    http: reqwest::Client,
    account_sid: String,
    auth_token: String,
}

impl TwilioApi {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            account_sid,
            auth_token,
        }
    }

    fn call_url(&self, call_sid: &str) -> String {
        format!(
            "{TWILIO_API_BASE}/Accounts/{}/Calls/{call_sid}.json",
            self.account_sid
        )
    }

    pub async fn fetch_call(&self, call_sid: &str) -> Result<CallDetails, AppError> {
        let res = self
            .http
            .get(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!(error=%e, call_sid, "failed to fetch twilio call");
                AppError("twilio call lookup failed")
            })?;
        res.json::<CallDetails>().await.map_err(|e| {
            error!(error=%e, call_sid, "failed to parse twilio call");
            AppError("twilio call lookup failed")
        })
    }

    /// Hang up a live call.
    pub async fn end_call(&self, call_sid: &str) -> Result<(), AppError> {
        let mut form = HashMap::new();
        form.insert("Status", "completed");
        self.http
            .post(self.call_url(call_sid))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&form)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| {
                error!(error=%e, call_sid, "failed to end twilio call");
                AppError("twilio hangup failed")
            })?;
        debug!(call_sid, "ended twilio call");
        Ok(())
    }
}
