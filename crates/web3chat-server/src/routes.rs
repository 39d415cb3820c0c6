//! HTTP surface of the relay. The relay only ever sees ciphertext.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use web3chat_core::{ChatError, MessageStore};

pub type SharedStore = Arc<MessageStore>;

type Reply = (StatusCode, Json<Value>);

pub fn router(store: SharedStore) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/messages", post(send_message).get(list_messages))
        .route("/api/messages/{id}/read", post(mark_read))
        .route("/health", get(|| async { "ok" }))
        .layer(cors)
        .with_state(store)
}

fn failure(status: StatusCode, error: &str) -> Reply {
    (status, Json(json!({ "success": false, "error": error })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub sender_id: String,
    pub recipient_id: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub reader_id: String,
}

/// `POST /api/messages`
pub async fn send_message(
    State(store): State<SharedStore>,
    body: Result<Json<SendRequest>, JsonRejection>,
) -> Reply {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(error = %e, "rejected message body");
            return failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send message");
        }
    };

    match store
        .append(&req.sender_id, &req.recipient_id, req.message)
        .await
    {
        Ok(envelope) => {
            tracing::info!(
                id = %envelope.id,
                sender = %envelope.sender_id,
                recipient = %envelope.recipient_id,
                "message stored"
            );
            (
                StatusCode::OK,
                Json(json!({ "success": true, "messageId": envelope.id })),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to store message");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to send message")
        }
    }
}

/// `GET /api/messages?userId=`
pub async fn list_messages(
    State(store): State<SharedStore>,
    Query(query): Query<ListQuery>,
) -> Reply {
    let Some(user_id) = query.user_id.filter(|id| !id.is_empty()) else {
        return failure(StatusCode::BAD_REQUEST, "User ID is required");
    };

    match store.query(&user_id).await {
        Ok(messages) => {
            tracing::debug!(user = %user_id, count = messages.len(), "messages fetched");
            (
                StatusCode::OK,
                Json(json!({ "success": true, "messages": messages })),
            )
        }
        Err(e) => {
            tracing::error!(user = %user_id, error = %e, "failed to fetch messages");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch messages")
        }
    }
}

/// `POST /api/messages/{id}/read`
pub async fn mark_read(
    State(store): State<SharedStore>,
    Path(id): Path<String>,
    body: Result<Json<ReadRequest>, JsonRejection>,
) -> Reply {
    let Ok(Json(req)) = body else {
        return failure(StatusCode::BAD_REQUEST, "Reader ID is required");
    };

    match store.mark_read(&req.reader_id, &id).await {
        Ok(envelope) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": envelope })),
        ),
        Err(ChatError::NotRecipient) => failure(
            StatusCode::FORBIDDEN,
            "Only the recipient can mark a message as read",
        ),
        Err(ChatError::NotFound(_)) => failure(StatusCode::NOT_FOUND, "Message not found"),
        Err(e) => {
            tracing::error!(id = %id, error = %e, "failed to mark message read");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to update message")
        }
    }
}

#[cfg(test)]
mod tests {
    use web3chat_core::StoreConfig;

    use super::*;

    async fn relay() -> SharedStore {
        let store = Arc::new(MessageStore::from_config(&StoreConfig::default()).unwrap());
        store.connect("relay").await.unwrap();
        store
    }

    async fn send(store: &SharedStore, from: &str, to: &str, message: &str) -> Reply {
        send_message(
            State(Arc::clone(store)),
            Ok(Json(SendRequest {
                sender_id: from.into(),
                recipient_id: to.into(),
                message: message.into(),
            })),
        )
        .await
    }

    async fn list(store: &SharedStore, user: Option<&str>) -> Reply {
        list_messages(
            State(Arc::clone(store)),
            Query(ListQuery {
                user_id: user.map(str::to_string),
            }),
        )
        .await
    }

    #[tokio::test]
    async fn send_then_list_for_either_party() {
        let store = relay().await;
        let (status, Json(body)) = send(&store, "0xAAA", "0xBBB", "Y2lwaGVy").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let id = body["messageId"].as_str().unwrap().to_string();

        let (status, _) = send(&store, "0xbbb", "0xaaa", "cmVwbHk=").await;
        assert_eq!(status, StatusCode::OK);

        let (status, Json(body)) = list(&store, Some("0XBBB")).await;
        assert_eq!(status, StatusCode::OK);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["id"], id.as_str());
        assert_eq!(messages[0]["senderId"], "0xaaa");
        assert_eq!(messages[0]["recipientId"], "0xbbb");
        assert_eq!(messages[0]["message"], "Y2lwaGVy");
        assert_eq!(messages[0]["read"], false);
        assert!(messages[0]["timestamp"].as_u64().unwrap() <= messages[1]["timestamp"].as_u64().unwrap());
    }

    #[tokio::test]
    async fn list_requires_user_id() {
        let store = relay().await;
        for user in [None, Some("")] {
            let (status, Json(body)) = list(&store, user).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "User ID is required");
        }
    }

    #[tokio::test]
    async fn store_failures_become_generic_errors() {
        let store = Arc::new(MessageStore::from_config(&StoreConfig::default()).unwrap());

        let (status, Json(body)) = send(&store, "0xa", "0xb", "c").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "success": false, "error": "Failed to send message" }));

        let (status, Json(body)) = list(&store, Some("0xa")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to fetch messages");
    }

    #[tokio::test]
    async fn read_receipts_follow_recipient_rule() {
        let store = relay().await;
        let (_, Json(body)) = send(&store, "0xa", "0xb", "c").await;
        let id = body["messageId"].as_str().unwrap().to_string();

        let read_as = |reader: &str| {
            mark_read(
                State(Arc::clone(&store)),
                Path(id.clone()),
                Ok(Json(ReadRequest {
                    reader_id: reader.into(),
                })),
            )
        };

        let (status, _) = read_as("0xa").await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, Json(body)) = read_as("0xB").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"]["read"], true);

        let (status, _) = mark_read(
            State(Arc::clone(&store)),
            Path("missing".into()),
            Ok(Json(ReadRequest {
                reader_id: "0xb".into(),
            })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
