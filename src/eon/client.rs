//! E.ON Next (Kraken) GraphQL HTTP client

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{DecodingKey, Validation};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use super::operations::{
    join_messages, AccountMeters, AccountNumbers, GraphQlRequest, GraphQlResponse, MeterConsumption,
    ObtainToken, Operation,
};
use super::MeteringApi;
use crate::config::ApiConfig;
use crate::error::SyncError;
use crate::models::{ConsumptionPage, Credential, Meter};

/// Token lifetime assumed when neither the payload nor the JWT carries `exp`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

pub struct EonClient {
    endpoint: Url,
    http_client: Client,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    exp: Option<i64>,
}

impl EonClient {
    pub fn new(config: &ApiConfig) -> Result<Self, SyncError> {
        let http_client = Client::builder()
            .timeout(config.timeout())
            .user_agent(concat!("eon-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            http_client,
        })
    }

    /// Run one operation; `token` is absent only for login
    pub async fn execute<O: Operation>(
        &self,
        operation: &O,
        token: Option<&str>,
    ) -> Result<O::Output, SyncError> {
        let mut request = self
            .http_client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .json(&GraphQlRequest::new(operation));

        if let Some(token) = token {
            request = request.header("Authorization", format!("JWT {}", token));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SyncError::from_transport(O::NAME, e))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(match token {
                Some(_) => SyncError::AuthenticationExpired,
                None => SyncError::Authentication(format!("{} rejected: {}", O::NAME, status)),
            });
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::Transient(format!("{} returned {}", O::NAME, status)));
        }
        if !status.is_success() {
            return Err(SyncError::Remote(format!("{} returned {}", O::NAME, status)));
        }

        let result: GraphQlResponse<O::Data> = resp
            .json()
            .await
            .map_err(|e| SyncError::from_transport(O::NAME, e))?;

        if !result.errors.is_empty() {
            if token.is_some() && result.errors.iter().any(|e| e.is_auth_expired()) {
                return Err(SyncError::AuthenticationExpired);
            }
            return Err(SyncError::Remote(join_messages(&result.errors)));
        }

        let data = result
            .data
            .ok_or_else(|| SyncError::Remote(format!("{} returned no data", O::NAME)))?;

        operation.extract(data)
    }
}

/// Expiry from the token payload `exp`, else the JWT claims, else a default lifetime
pub fn token_expiry(token: &str, payload: Option<&Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    let from_payload = payload.and_then(|p| p.get("exp")).and_then(Value::as_i64);

    let exp = from_payload.or_else(|| {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .and_then(|data| data.claims.exp)
    });

    exp.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| now + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS))
}

#[async_trait]
impl MeteringApi for EonClient {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Credential, SyncError> {
        let result = self
            .execute(&ObtainToken::new(username, password), None)
            .await
            .map_err(|e| match e {
                SyncError::Remote(msg) => SyncError::Authentication(msg),
                other => other,
            })?;

        let expires_at = token_expiry(&result.token, result.payload.as_ref(), Utc::now());
        Ok(Credential::new(result.token, expires_at))
    }

    async fn account_numbers(&self, credential: &Credential) -> Result<Vec<String>, SyncError> {
        self.execute(&AccountNumbers {}, Some(credential.token()))
            .await
    }

    async fn meters(
        &self,
        credential: &Credential,
        account_number: &str,
    ) -> Result<Vec<Meter>, SyncError> {
        self.execute(&AccountMeters::new(account_number), Some(credential.token()))
            .await
    }

    async fn consumption_page(
        &self,
        credential: &Credential,
        request: &MeterConsumption,
    ) -> Result<ConsumptionPage, SyncError> {
        self.execute(request, Some(credential.token())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MeterKind, SyncWindow};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    type Heads = Arc<Mutex<Vec<String>>>;

    /// Read one request; returns its lowercased head
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return String::from_utf8_lossy(&buf).to_lowercase();
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    return head;
                }
            }
        }
    }

    /// Answer one connection per canned `(status, body)`, in order
    async fn canned_server(responses: Vec<(u16, &'static str)>) -> (Url, Heads) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let heads: Heads = Arc::new(Mutex::new(Vec::new()));
        let seen = heads.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let head = read_request(&mut socket).await;
                seen.lock().unwrap().push(head);
                let reply = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (Url::parse(&format!("http://{}/v1/graphql/", addr)).unwrap(), heads)
    }

    fn client_for(endpoint: Url, timeout: std::time::Duration) -> EonClient {
        EonClient {
            endpoint,
            http_client: Client::builder().no_proxy().timeout(timeout).build().unwrap(),
        }
    }

    async fn client_with(responses: Vec<(u16, &'static str)>) -> (EonClient, Heads) {
        let (url, heads) = canned_server(responses).await;
        (client_for(url, std::time::Duration::from_secs(5)), heads)
    }

    fn credential() -> Credential {
        Credential::new("tok-123", Utc::now() + Duration::hours(1))
    }

    fn page_request() -> MeterConsumption {
        let meter = Meter {
            serial: "METER123".to_string(),
            kind: MeterKind::Electricity,
            remote_id: "meter-id-123".to_string(),
            account_number: "ACC123".to_string(),
        };
        let window = SyncWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        );
        MeterConsumption::new(&meter, &window, 100, None)
    }

    #[tokio::test]
    async fn test_login_and_query_succeed() {
        let (client, heads) = client_with(vec![
            (
                200,
                r#"{"data":{"obtainKrakenToken":{"token":"tok-123","payload":{"exp":1704070800}}}}"#,
            ),
            (200, r#"{"data":{"viewer":{"accounts":[{"number":"A-1"},{"number":"A-2"}]}}}"#),
        ])
        .await;

        let credential = client.authenticate("a@b.c", "pw").await.unwrap();
        assert_eq!(credential.token(), "tok-123");
        assert_eq!(credential.expires_at(), Utc.timestamp_opt(1_704_070_800, 0).unwrap());

        let accounts = client.account_numbers(&credential).await.unwrap();
        assert_eq!(accounts, vec!["A-1".to_string(), "A-2".to_string()]);

        let heads = heads.lock().unwrap();
        assert!(!heads[0].contains("authorization"));
        assert!(heads[1].contains("authorization: jwt tok-123"));
    }

    #[tokio::test]
    async fn test_unauthorized_with_token_is_expiry() {
        let (client, _) = client_with(vec![(401, "{}"), (403, "{}")]).await;

        let err = client.consumption_page(&credential(), &page_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationExpired));

        let err = client.account_numbers(&credential()).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationExpired));
    }

    #[tokio::test]
    async fn test_unauthorized_login_is_authentication_error() {
        let (client, _) = client_with(vec![(401, "{}")]).await;
        let err = client.authenticate("a@b.c", "wrong").await.unwrap_err();
        assert!(matches!(err, SyncError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_server_errors_and_throttling_are_transient() {
        let (client, _) = client_with(vec![(503, "{}"), (429, "{}"), (404, "{}")]).await;

        let err = client.consumption_page(&credential(), &page_request()).await.unwrap_err();
        assert!(err.is_retryable());
        let err = client.consumption_page(&credential(), &page_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
        let err = client.consumption_page(&credential(), &page_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
    }

    #[tokio::test]
    async fn test_graphql_errors_are_joined_into_remote_error() {
        let (client, _) = client_with(vec![(
            200,
            r#"{"data":null,"errors":[{"message":"Meter offline"},{"message":"Try later","extensions":{"errorCode":"KT-CT-4321"}}]}"#,
        )])
        .await;

        match client.account_numbers(&credential()).await {
            Err(SyncError::Remote(msg)) => assert_eq!(msg, "Meter offline; Try later"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_token_error_code_is_expiry() {
        let (client, _) = client_with(vec![(
            200,
            r#"{"errors":[{"message":"Signature of the JWT has expired.","extensions":{"errorCode":"KT-CT-1124"}}]}"#,
        )])
        .await;

        let err = client.consumption_page(&credential(), &page_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthenticationExpired));
    }

    #[tokio::test]
    async fn test_login_graphql_error_is_authentication_error() {
        let (client, _) = client_with(vec![(
            200,
            r#"{"errors":[{"message":"Invalid data.","extensions":{"errorCode":"KT-CT-1138"}}]}"#,
        )])
        .await;

        match client.authenticate("a@b.c", "wrong").await {
            Err(SyncError::Authentication(msg)) => assert_eq!(msg, "Invalid data."),
            other => panic!("expected authentication error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_remote_error() {
        let (client, _) = client_with(vec![(200, "not json")]).await;
        let err = client.account_numbers(&credential()).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let url = Url::parse(&format!("http://{}/v1/graphql/", addr)).unwrap();
        let client = client_for(url, std::time::Duration::from_millis(200));

        let err = client.consumption_page(&credential(), &page_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient(_)));
    }

    #[derive(Serialize)]
    struct Claims {
        sub: String,
        exp: i64,
    }

    #[test]
    fn test_expiry_from_payload() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let payload = serde_json::json!({"exp": 1_704_070_800i64, "email": "a@b.c"});
        let expiry = token_expiry("not-a-jwt", Some(&payload), now);
        assert_eq!(expiry, Utc.timestamp_opt(1_704_070_800, 0).unwrap());
    }

    #[test]
    fn test_expiry_from_jwt_claims() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let claims = Claims {
            sub: "kraken|user".to_string(),
            exp: 1_704_074_400,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"unrelated"),
        )
        .unwrap();
        assert_eq!(
            token_expiry(&token, None, now),
            Utc.timestamp_opt(1_704_074_400, 0).unwrap()
        );
    }

    #[test]
    fn test_expiry_from_jwt_with_audience() {
        #[derive(Serialize)]
        struct AudienceClaims {
            sub: String,
            aud: String,
            exp: i64,
        }

        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let claims = AudienceClaims {
            sub: "kraken|user".to_string(),
            aud: "kraken".to_string(),
            exp: 1_704_078_000,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"k")).unwrap();
        assert_eq!(
            token_expiry(&token, None, now),
            Utc.timestamp_opt(1_704_078_000, 0).unwrap()
        );
    }

    #[test]
    fn test_expiry_defaults_to_one_hour() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(token_expiry("opaque", None, now), now + Duration::hours(1));
    }
}
