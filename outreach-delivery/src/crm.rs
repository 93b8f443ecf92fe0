use anyhow::{anyhow, Result};
use async_trait::async_trait;
use outreach_core::config::CrmConfig;
use outreach_core::{Channel, ChannelAdapter, Contact, SendOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing;

const MESSAGES_PATH: &str = "/conversations/messages";

/// Minimal escaping for plain text dropped into an email body.
fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '\n' => out.push_str("<br>"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CrmMessageRequest<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    contact_id: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrmMessageResponse {
    message_id: Option<String>,
    conversation_id: Option<String>,
}

/// Conversation message type for a single-transport channel. `Both` fans out
/// to SMS and Email and has no type of its own.
pub(crate) fn crm_message_type(channel: Channel) -> Option<&'static str> {
    match channel {
        Channel::Sms => Some("SMS"),
        Channel::Email => Some("Email"),
        Channel::Dm | Channel::Instagram => Some("IG"),
        Channel::Facebook => Some("FB"),
        Channel::Whatsapp => Some("WhatsApp"),
        Channel::Both => None,
    }
}

/// Sends messages through the CRM's conversations API.
pub struct CrmChannel {
    client: Option<reqwest::Client>,
    endpoint: String,
    api_key: Option<String>,
    api_version: String,
}

impl CrmChannel {
    pub fn new(config: &CrmConfig) -> Result<Self> {
        let client = match &config.api_key {
            Some(_) => {
                tracing::info!("Initializing CRM client for {}", config.api_base);
                let client = reqwest::Client::builder()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .build()
                    .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;
                Some(client)
            }
            None => {
                tracing::warn!("CRM delivery disabled (missing CRM_API_KEY)");
                None
            }
        };

        Ok(Self {
            client,
            endpoint: format!("{}{}", config.api_base.trim_end_matches('/'), MESSAGES_PATH),
            api_key: config.api_key.clone(),
            api_version: config.api_version.clone(),
        })
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        request: &CrmMessageRequest<'_>,
        idempotency_key: &str,
    ) -> Result<SendOutcome> {
        let response = client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Version", &self.api_version)
            .header("Idempotency-Key", idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to send HTTP request to CRM: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::warn!("CRM rejected {} message: {} {}", request.kind, status, error_text);
            return Ok(SendOutcome::rejected(format!(
                "{}: {}",
                status.as_u16(),
                error_text
            )));
        }

        // a 2xx means the CRM took the message; a bad body only loses the external id
        let external_id = match response.text().await {
            Ok(text) => match serde_json::from_str::<CrmMessageResponse>(&text) {
                Ok(body) => body.message_id.or(body.conversation_id),
                Err(e) => {
                    tracing::warn!("CRM accepted {} message but sent an unreadable body: {}", request.kind, e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("CRM accepted {} message but the body could not be read: {}", request.kind, e);
                None
            }
        };

        Ok(SendOutcome {
            success: true,
            external_id,
            error: None,
        })
    }

    async fn send_one(
        &self,
        client: &reqwest::Client,
        api_key: &str,
        crm_contact_id: &str,
        content: &str,
        kind: &'static str,
        idempotency_key: &str,
    ) -> Result<SendOutcome> {
        let request = CrmMessageRequest {
            kind,
            contact_id: crm_contact_id,
            message: content,
            html: (kind == "Email").then(|| html_escape(content)),
        };
        self.post(client, api_key, &request, idempotency_key).await
    }
}

#[async_trait]
impl ChannelAdapter for CrmChannel {
    async fn send(
        &self,
        contact: &Contact,
        content: &str,
        channel: Channel,
        idempotency_key: &str,
    ) -> Result<SendOutcome> {
        let Some(crm_contact_id) = contact.crm_contact_id.as_deref() else {
            return Ok(SendOutcome::rejected("contact has no CRM id"));
        };
        let (Some(client), Some(api_key)) = (&self.client, &self.api_key) else {
            return Ok(SendOutcome::rejected("CRM channel not configured"));
        };

        match crm_message_type(channel) {
            Some(kind) => {
                self.send_one(client, api_key, crm_contact_id, content, kind, idempotency_key)
                    .await
            }
            None => {
                // SMS id is the external id; email must also land for success
                let sms_key = format!("{}:sms", idempotency_key);
                let sms = self
                    .send_one(client, api_key, crm_contact_id, content, "SMS", &sms_key)
                    .await?;
                if !sms.success {
                    return Ok(sms);
                }

                let email_key = format!("{}:email", idempotency_key);
                let email = self
                    .send_one(client, api_key, crm_contact_id, content, "Email", &email_key)
                    .await?;
                if !email.success {
                    let error = email.error.unwrap_or_default();
                    tracing::warn!(
                        "Email leg failed after SMS {:?} was sent: {}",
                        sms.external_id,
                        error
                    );
                    return Ok(SendOutcome::rejected(format!("email: {}", error)));
                }
                Ok(sms)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Clone, Default)]
    struct Seen {
        requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
        fail_type: Option<&'static str>,
        plain_text_reply: bool,
    }

    async fn capture(
        State(seen): State<Seen>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        let kind = body["type"].as_str().unwrap_or_default().to_string();
        seen.requests.lock().unwrap().push((headers, body));
        if seen.fail_type == Some(kind.as_str()) {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"message": "invalid contact"})),
            )
                .into_response();
        }
        if seen.plain_text_reply {
            return (StatusCode::CREATED, "queued").into_response();
        }
        (
            StatusCode::OK,
            Json(json!({"messageId": format!("msg-{}", kind), "conversationId": "conv-1"})),
        )
            .into_response()
    }

    async fn crm_stub(seen: Seen) -> CrmConfig {
        let app = Router::new()
            .route(MESSAGES_PATH, post(capture))
            .with_state(seen);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        CrmConfig {
            api_base: format!("http://{}/", addr),
            api_key: Some("test-key".to_string()),
            api_version: "2021-04-15".to_string(),
            timeout_secs: 5,
        }
    }

    fn contact() -> Contact {
        Contact::new(Uuid::new_v4(), Some("crm-42"))
    }

    #[test]
    fn channels_map_to_crm_types() {
        assert_eq!(crm_message_type(Channel::Sms), Some("SMS"));
        assert_eq!(crm_message_type(Channel::Email), Some("Email"));
        assert_eq!(crm_message_type(Channel::Dm), Some("IG"));
        assert_eq!(crm_message_type(Channel::Instagram), Some("IG"));
        assert_eq!(crm_message_type(Channel::Facebook), Some("FB"));
        assert_eq!(crm_message_type(Channel::Whatsapp), Some("WhatsApp"));
        assert_eq!(crm_message_type(Channel::Both), None);
    }

    #[test]
    fn email_body_is_escaped() {
        assert_eq!(
            html_escape("Hi <b>Sam</b> & co\nsee you"),
            "Hi &lt;b&gt;Sam&lt;/b&gt; &amp; co<br>see you"
        );
    }

    #[tokio::test]
    async fn sms_send_carries_auth_version_and_idempotency_key() {
        let seen = Seen::default();
        let channel = CrmChannel::new(&crm_stub(seen.clone()).await).unwrap();

        let outcome = channel
            .send(&contact(), "See you at 6", Channel::Sms, "message-1")
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::delivered("msg-SMS"));
        let requests = seen.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];
        assert_eq!(headers["authorization"], "Bearer test-key");
        assert_eq!(headers["version"], "2021-04-15");
        assert_eq!(headers["idempotency-key"], "message-1");
        assert_eq!(body["type"], "SMS");
        assert_eq!(body["contactId"], "crm-42");
        assert_eq!(body["message"], "See you at 6");
        assert!(body.get("html").is_none());
    }

    #[tokio::test]
    async fn both_sends_sms_then_email_and_keeps_sms_id() {
        let seen = Seen::default();
        let channel = CrmChannel::new(&crm_stub(seen.clone()).await).unwrap();

        let outcome = channel
            .send(&contact(), "Hello", Channel::Both, "message-2")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.external_id.as_deref(), Some("msg-SMS"));
        let requests = seen.requests.lock().unwrap();
        let kinds: Vec<&str> = requests
            .iter()
            .map(|(_, body)| body["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["SMS", "Email"]);
        assert_eq!(requests[1].0["idempotency-key"], "message-2:email");
        assert_eq!(requests[1].1["html"], "Hello");
    }

    #[tokio::test]
    async fn both_fails_when_email_leg_is_rejected() {
        let seen = Seen {
            fail_type: Some("Email"),
            ..Seen::default()
        };
        let channel = CrmChannel::new(&crm_stub(seen.clone()).await).unwrap();

        let outcome = channel
            .send(&contact(), "Hello", Channel::Both, "message-3")
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().starts_with("email: 422"));
    }

    #[tokio::test]
    async fn non_success_status_becomes_failed_outcome() {
        let seen = Seen {
            fail_type: Some("WhatsApp"),
            ..Seen::default()
        };
        let channel = CrmChannel::new(&crm_stub(seen).await).unwrap();

        let outcome = channel
            .send(&contact(), "Hello", Channel::Whatsapp, "message-4")
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.external_id, None);
        let error = outcome.error.unwrap();
        assert!(error.starts_with("422: "), "{}", error);
        assert!(error.contains("invalid contact"));
    }

    #[tokio::test]
    async fn accepted_send_with_unreadable_body_still_succeeds() {
        let seen = Seen {
            plain_text_reply: true,
            ..Seen::default()
        };
        let channel = CrmChannel::new(&crm_stub(seen.clone()).await).unwrap();

        let outcome = channel
            .send(&contact(), "See you at 6", Channel::Sms, "message-7")
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.external_id, None);
        assert_eq!(outcome.error, None);
        assert_eq!(seen.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contact_without_crm_id_is_rejected_without_a_request() {
        let seen = Seen::default();
        let channel = CrmChannel::new(&crm_stub(seen.clone()).await).unwrap();
        let contact = Contact::new(Uuid::new_v4(), None);

        let outcome = channel
            .send(&contact, "Hello", Channel::Sms, "message-5")
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::rejected("contact has no CRM id"));
        assert!(seen.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_api_key_disables_sending() {
        let channel = CrmChannel::new(&CrmConfig::default()).unwrap();

        let outcome = channel
            .send(&contact(), "Hello", Channel::Sms, "message-6")
            .await
            .unwrap();

        assert_eq!(outcome, SendOutcome::rejected("CRM channel not configured"));
    }
}
