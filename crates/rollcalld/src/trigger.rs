//! Remote motion trigger: a polled 0/1 flag on an HTTP endpoint.

use crate::config::Config;
use serde_json::Value;
use std::future::Future;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// One read of the remote flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerReading {
    /// Integer value of the field; `None` when absent, empty or non-numeric.
    pub value: Option<i64>,
}

impl TriggerReading {
    pub fn is_asserted(&self) -> bool {
        self.value == Some(1)
    }
}

/// Reads and clears the remote trigger.
pub trait TriggerTransport {
    fn read(&self) -> impl Future<Output = Result<TriggerReading, TriggerError>>;

    /// Set the remote flag back to 0.
    fn reset(&self) -> impl Future<Output = Result<(), TriggerError>>;
}

/// Trigger exposed as a JSON field over HTTP (ThingSpeak-style channel feed).
pub struct HttpTrigger {
    client: reqwest::Client,
    read_url: String,
    read_key: Option<String>,
    reset_url: String,
    write_key: Option<String>,
    field: String,
}

impl HttpTrigger {
    pub fn new(config: &Config) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self {
            client,
            read_url: config.trigger_read_url.clone(),
            read_key: config.trigger_read_key.clone(),
            reset_url: config.trigger_reset_url.clone(),
            write_key: config.trigger_write_key.clone(),
            field: config.trigger_field.clone(),
        })
    }
}

impl TriggerTransport for HttpTrigger {
    async fn read(&self) -> Result<TriggerReading, TriggerError> {
        let mut request = self.client.get(&self.read_url);
        if let Some(key) = &self.read_key {
            request = request.query(&[("api_key", key)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TriggerError::Status(response.status()));
        }
        let body: Value = response.json().await?;
        parse_reading(&body, &self.field)
    }

    async fn reset(&self) -> Result<(), TriggerError> {
        let mut form: Vec<(&str, &str)> = Vec::with_capacity(2);
        if let Some(key) = &self.write_key {
            form.push(("api_key", key));
        }
        form.push((&self.field, "0"));

        let response = self.client.post(&self.reset_url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(TriggerError::Status(response.status()));
        }
        Ok(())
    }
}

/// Extract `field` from a trigger payload.
///
/// The field may be a JSON number or a numeric string (ThingSpeak sends
/// `"field1": "1"`). Missing, null, empty or non-numeric values read as
/// not asserted rather than as errors; only a non-object body is malformed.
pub fn parse_reading(body: &Value, field: &str) -> Result<TriggerReading, TriggerError> {
    let object = body
        .as_object()
        .ok_or_else(|| TriggerError::Malformed(format!("expected JSON object, got {body}")))?;

    let value = match object.get(field) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(TriggerReading { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{trigger_config, FEED_PATH, RESET_PATH};
    use serde_json::json;
    use wiremock::matchers::{body_string, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_string_and_number_values() {
        assert!(parse_reading(&json!({"field1": "1"}), "field1").unwrap().is_asserted());
        assert!(parse_reading(&json!({"field1": 1}), "field1").unwrap().is_asserted());
        assert!(parse_reading(&json!({"field1": " 1 "}), "field1").unwrap().is_asserted());
        assert!(!parse_reading(&json!({"field1": "0"}), "field1").unwrap().is_asserted());
    }

    #[test]
    fn test_only_exactly_one_asserts() {
        for body in [
            json!({"field1": "2"}),
            json!({"field1": -1}),
            json!({"field1": 1.5}),
            json!({"field1": ""}),
            json!({"field1": null}),
            json!({"field1": true}),
            json!({"field2": "1"}),
            json!({}),
        ] {
            let reading = parse_reading(&body, "field1").unwrap();
            assert!(!reading.is_asserted(), "{body} should not assert");
        }
    }

    #[test]
    fn test_non_object_is_malformed() {
        assert!(matches!(
            parse_reading(&json!([1]), "field1"),
            Err(TriggerError::Malformed(_))
        ));
        assert!(parse_reading(&json!("1"), "field1").is_err());
    }

    #[test]
    fn test_configured_field_name() {
        let reading = parse_reading(&json!({"field1": "0", "motion": "1"}), "motion").unwrap();
        assert_eq!(reading.value, Some(1));
    }

    #[tokio::test]
    async fn test_read_sends_key_and_parses_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FEED_PATH))
            .and(query_param("api_key", "READKEY"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"entry_id": 42, "field1": "1"})))
            .expect(1)
            .mount(&server)
            .await;

        let trigger = HttpTrigger::new(&trigger_config(&server.uri())).unwrap();
        assert!(trigger.read().await.unwrap().is_asserted());
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FEED_PATH))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"field1": "1"})))
            .mount(&server)
            .await;

        let trigger = HttpTrigger::new(&trigger_config(&server.uri())).unwrap();
        let err = trigger.read().await.unwrap_err();
        assert!(
            matches!(err, TriggerError::Status(status) if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_non_json_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(FEED_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("-1"))
            .mount(&server)
            .await;

        let trigger = HttpTrigger::new(&trigger_config(&server.uri())).unwrap();
        // Valid JSON but not an object.
        assert!(matches!(trigger.read().await, Err(TriggerError::Malformed(_))));

        server.reset().await;
        Mock::given(method("GET"))
            .and(path(FEED_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        assert!(matches!(trigger.read().await, Err(TriggerError::Http(_))));
    }

    #[tokio::test]
    async fn test_reset_posts_zero_with_write_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RESET_PATH))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string("api_key=WRITEKEY&field1=0"))
            .respond_with(ResponseTemplate::new(200).set_body_string("43"))
            .expect(1)
            .mount(&server)
            .await;

        let trigger = HttpTrigger::new(&trigger_config(&server.uri())).unwrap();
        trigger.reset().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.path(), RESET_PATH);
    }

    #[tokio::test]
    async fn test_reset_without_key_and_refused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RESET_PATH))
            .and(body_string("motion=0"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = trigger_config(&server.uri());
        config.trigger_write_key = None;
        config.trigger_field = "motion".into();
        let trigger = HttpTrigger::new(&config).unwrap();

        assert!(matches!(
            trigger.reset().await,
            Err(TriggerError::Status(status)) if status == reqwest::StatusCode::FORBIDDEN
        ));
    }
}
