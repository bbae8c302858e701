//! Wire protocol model
//!
//! One JSON object per newline-terminated line in both directions. The
//! request shape is a single flat object whose fields are reused across
//! commands (`key` carries a vector id for `INSERT_VECTOR`, `dimension`
//! carries `k` for `SEARCH_TOPK`, `data` carries the space name for
//! `DELETE_SPACE` and the username for `GET_USER`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::auth::{Permission, Role, User};
use crate::spaces::EngineKind;

/// Command discriminator of a request line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    Put,
    Get,
    Delete,
    CreateSpace,
    ListSpaces,
    DeleteSpace,
    UseSpace,
    CreateUser,
    DeleteUser,
    UpdateUserPassword,
    UpdateUserRole,
    UpdateUserPermissions,
    GetUser,
    InsertVector,
    SearchTopk,
    GetVector,
    RangeSearch,
}

/// A decoded command line
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub command: CommandType,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub space: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub new_user: Option<UserPayload>,
    #[serde(default)]
    pub delete_user: Option<UsernamePayload>,
    #[serde(default)]
    pub engine_type: Option<EngineKind>,
    #[serde(default)]
    pub dimension: i64,
    #[serde(default)]
    pub index_type: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub radius: f32,
    #[serde(default)]
    pub enable_wal: Option<bool>,
}

/// User fields carried by the user-management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub permissions: HashMap<String, Permission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsernamePayload {
    pub username: String,
}

/// The first line of a session
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// One search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub id: i64,
    pub distance: f32,
}

/// Successful command result, serialized as one JSON line
#[derive(Debug, Clone)]
pub enum Response {
    /// `{"status":"OK","message":...}`
    Message(String),
    /// `{"status":"OK","value":...}`
    Value(String),
    /// `{"status":"OK","spaces":[...]}`
    Spaces(Vec<String>),
    /// Bare array of `{"id","distance"}` objects
    Hits(Vec<Hit>),
}

impl Response {
    pub fn message(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Serialize to the single-line wire form (no trailing newline)
    pub fn to_line(&self) -> String {
        match self {
            Response::Message(message) => {
                serde_json::json!({"status": "OK", "message": message}).to_string()
            }
            Response::Value(value) => {
                serde_json::json!({"status": "OK", "value": value}).to_string()
            }
            Response::Spaces(spaces) => {
                serde_json::json!({"status": "OK", "spaces": spaces}).to_string()
            }
            Response::Hits(hits) => serde_json::to_string(hits).unwrap_or_else(|_| "[]".into()),
        }
    }
}

/// The single-line error payload
pub fn error_line(message: &str) -> String {
    serde_json::json!({"status": "ERROR", "message": message}).to_string()
}

/// Login success payload; the stored password hash never leaves the server
pub fn login_ok_line(user: &User) -> String {
    serde_json::json!({
        "status": "OK",
        "user": {
            "username": user.username,
            "role": user.role,
            "permissions": user.permissions,
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_wire_names() {
        let req: Request =
            serde_json::from_str(r#"{"type":"SEARCH_TOPK","value":"1,2","dimension":5}"#).unwrap();
        assert_eq!(req.command, CommandType::SearchTopk);
        assert_eq!(req.dimension, 5);

        let req: Request = serde_json::from_str(r#"{"type":"GET_USER","data":"bob"}"#).unwrap();
        assert_eq!(req.command, CommandType::GetUser);
        assert_eq!(req.data, "bob");
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<Request>(r#"{"type":"EXPLODE"}"#).is_err());
    }

    #[test]
    fn test_create_space_request_fields() {
        let req: Request = serde_json::from_str(
            r#"{"type":"CREATE_SPACE","space":"vec1","engine_type":"vector",
                "dimension":4,"index_type":"IVF32,Flat","metric":"L2","enable_wal":true}"#,
        )
        .unwrap();
        assert_eq!(req.engine_type, Some(EngineKind::Vector));
        assert_eq!(req.enable_wal, Some(true));
        assert_eq!(req.index_type, "IVF32,Flat");
    }

    #[test]
    fn test_response_lines() {
        assert_eq!(
            Response::message("OK").to_line(),
            r#"{"message":"OK","status":"OK"}"#
        );
        assert_eq!(
            Response::Value("alice".into()).to_line(),
            r#"{"status":"OK","value":"alice"}"#
        );

        let hits = Response::Hits(vec![Hit {
            id: 1050,
            distance: 0.0,
        }]);
        let line = hits.to_line();
        assert!(line.starts_with('['));
        assert!(line.contains(r#""id":1050"#));

        assert_eq!(
            error_line("nope"),
            r#"{"message":"nope","status":"ERROR"}"#
        );
    }

    #[test]
    fn test_login_payload_hides_password_hash() {
        let user = User {
            username: "root".into(),
            password: "$2b$12$secret-hash".into(),
            role: Role::Admin,
            permissions: HashMap::new(),
        };
        let line = login_ok_line(&user);
        assert!(line.contains(r#""username":"root""#));
        assert!(!line.contains("secret-hash"));
    }
}
