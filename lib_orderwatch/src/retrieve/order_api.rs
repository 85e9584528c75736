//! # Order API
//!
//! Loads one order through `GET {base}/api/Order/GetOrderById/{id}`. This is
//! the fetch collaborator behind every push- and poll-triggered refresh.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use url::form_urlencoded::byte_serialize;

use super::ky_http::ApiClient;
use crate::core::EntityFetcher;
use crate::error::FetchError;
use crate::models::{EntityId, Order};

/// Relative path of the order lookup endpoint.
pub const ORDER_BY_ID_PATH: &str = "api/Order/GetOrderById";

/// [`EntityFetcher`] for orders.
#[derive(Clone)]
pub struct OrderApi {
    client: Arc<ApiClient>,
}

impl OrderApi {
    /// Wraps a configured client.
    pub fn new(client: ApiClient) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Fetches one order.
    pub async fn get_order(&self, order_id: &EntityId) -> Result<Order, FetchError> {
        fetch_order(&self.client, order_id).await
    }
}

impl EntityFetcher for OrderApi {
    type Payload = Order;

    fn fetch(&self, entity_id: &EntityId) -> BoxFuture<'static, Result<Order, FetchError>> {
        let client = Arc::clone(&self.client);
        let order_id = entity_id.clone();
        Box::pin(async move { fetch_order(&client, &order_id).await })
    }
}

async fn fetch_order(client: &ApiClient, order_id: &EntityId) -> Result<Order, FetchError> {
    let segment: String = byte_serialize(order_id.as_str().as_bytes()).collect();
    let path = format!("{}/{}", ORDER_BY_ID_PATH, segment);

    let response = client.get::<Order>(&path).await.map_err(classify)?;
    if response.success {
        return response
            .data
            .ok_or_else(|| FetchError::Decode(format!("empty body for order {}", order_id)));
    }
    match response.status {
        404 => Err(FetchError::NotFound(order_id.to_string())),
        status => Err(FetchError::Network(format!(
            "HTTP {} for order {}: {}",
            status,
            order_id,
            response.error_body.unwrap_or_default().trim()
        ))),
    }
}

fn classify(err: anyhow::Error) -> FetchError {
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_decode() {
            return FetchError::Decode(e.to_string());
        }
    }
    FetchError::Network(format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serves one canned HTTP response and hands back the raw request.
    fn mock_server(status_line: &str, body: &str) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
        let port = listener.local_addr().unwrap().port();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 4096];
                let n = stream.read(&mut buf).unwrap_or(0);
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());
                stream.write_all(response.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });
        (format!("http://127.0.0.1:{}", port), rx)
    }

    fn api(base: &str) -> OrderApi {
        OrderApi::new(ApiClient::new(base, Some("secret".into()), 0, None).unwrap())
    }

    #[tokio::test]
    async fn fetches_order_with_bearer_token() {
        let body = r#"{"id":42,"isAssigned":true,"totalPrice":12.5,"delivery":{"firstName":"Sam","lastName":"Reed"}}"#;
        let (base, requests) = mock_server("200 OK", body);

        let order = api(&base).fetch(&EntityId::from(42u64)).await.unwrap();
        assert_eq!(order.id, 42);
        assert!(order.is_assigned);
        assert_eq!(order.delivery_name().as_deref(), Some("Sam Reed"));

        let request = requests.recv().unwrap();
        assert!(request.starts_with("GET /api/Order/GetOrderById/42 "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let (base, _) = mock_server("404 Not Found", "");
        let err = api(&base).get_order(&EntityId::from(7u64)).await.unwrap_err();
        assert_eq!(err, FetchError::NotFound("7".into()));
    }

    #[tokio::test]
    async fn server_error_is_a_network_error() {
        let (base, _) = mock_server("500 Internal Server Error", "boom");
        let err = api(&base).get_order(&EntityId::from(7u64)).await.unwrap_err();
        assert!(matches!(err, FetchError::Network(msg) if msg.contains("500") && msg.contains("boom")));
    }

    #[tokio::test]
    async fn unexpected_body_is_a_decode_error() {
        let (base, _) = mock_server("200 OK", r#"{"orders":[]}"#);
        let err = api(&base).get_order(&EntityId::from(7u64)).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = api(&format!("http://127.0.0.1:{}", port))
            .get_order(&EntityId::from(1u64))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Network(_)));
    }
}
