//! Query engine
//!
//! One-shot execution of a decoded command: permission gating, namespace
//! resolution, engine dispatch, and response shaping. The engine sum type
//! keeps the operation/engine-kind pairing checked at compile time.

pub mod model;

pub use model::{
    error_line, login_ok_line, CommandType, Hit, LoginRequest, Request, Response,
};

use std::sync::Arc;

use crate::auth::{AuthManager, Permission, Role, User};
use crate::error::{DbError, Result};
use crate::spaces::{CreateSpace, Engine, EngineKind, SpaceManager};

/// Executes decoded commands against the shared managers
pub struct QueryEngine {
    spaces: Arc<SpaceManager>,
    auth: Arc<AuthManager>,
}

impl QueryEngine {
    pub fn new(spaces: Arc<SpaceManager>, auth: Arc<AuthManager>) -> Self {
        Self { spaces, auth }
    }

    /// Execute one command for an authenticated session.
    ///
    /// `session_space` is the session's currently-selected space; commands
    /// naming an explicit `space` take precedence, and `USE_SPACE` updates
    /// the selection.
    pub fn execute(
        &self,
        user: &User,
        session_space: &mut String,
        req: Request,
    ) -> Result<Response> {
        let space = if req.space.is_empty() {
            session_space.clone()
        } else {
            req.space.clone()
        };

        self.authorize(user, req.command, &space)?;

        match req.command {
            CommandType::UseSpace => {
                if space.is_empty() {
                    return Err(DbError::bad_request("space name required"));
                }
                self.spaces.get_space(&space)?;
                *session_space = space;
                Ok(Response::message("SPACE_CHANGED"))
            }

            CommandType::CreateSpace => {
                if req.space.is_empty() {
                    return Err(DbError::bad_request("space name required"));
                }
                self.spaces.create_space(CreateSpace {
                    name: req.space,
                    engine_type: req.engine_type.unwrap_or(EngineKind::KeyValue),
                    dimension: req.dimension.max(0) as usize,
                    index_type: req.index_type,
                    metric: req.metric,
                    wal_enabled: req.enable_wal,
                })?;
                Ok(Response::message("SPACE_CREATED"))
            }

            CommandType::DeleteSpace => {
                if req.data.is_empty() {
                    return Err(DbError::bad_request("space name required"));
                }
                self.spaces.delete_space(&req.data)?;
                Ok(Response::message("SPACE_DELETED"))
            }

            CommandType::ListSpaces => Ok(Response::Spaces(self.spaces.list_spaces())),

            CommandType::Put | CommandType::Get | CommandType::Delete => {
                let engine = self.key_value_engine(&space)?;
                match req.command {
                    CommandType::Put => {
                        engine.put(&req.key, &req.value)?;
                        Ok(Response::message("OK"))
                    }
                    CommandType::Get => Ok(Response::Value(engine.get(&req.key)?)),
                    CommandType::Delete => {
                        engine.delete(&req.key)?;
                        Ok(Response::message("DELETED"))
                    }
                    _ => unreachable!(),
                }
            }

            CommandType::InsertVector => {
                let (engine, dimension) = self.vector_engine(&space)?;
                let id = parse_vector_id(&req.key)?;
                let vector = parse_vector(&req.value, dimension)?;
                engine.insert(id, &vector)?;
                Ok(Response::message("VECTOR_INSERTED"))
            }

            CommandType::SearchTopk => {
                let (engine, dimension) = self.vector_engine(&space)?;
                let vector = parse_vector(&req.value, dimension)?;
                let k = if req.dimension > 0 { req.dimension as usize } else { 1 };
                let hits = engine.search_topk(&vector, k)?;
                Ok(hits_response(hits))
            }

            CommandType::RangeSearch => {
                let (engine, dimension) = self.vector_engine(&space)?;
                let vector = parse_vector(&req.value, dimension)?;
                let radius = if req.radius > 0.0 { req.radius } else { 1.0 };
                let hits = engine.range_search(&vector, radius)?;
                Ok(hits_response(hits))
            }

            CommandType::GetVector => {
                let (engine, _) = self.vector_engine(&space)?;
                let id = parse_vector_id(&req.key)?;
                let vector = engine.get_vector(id)?;
                Ok(Response::Value(format_vector(&vector)))
            }

            CommandType::CreateUser => {
                let payload = req
                    .new_user
                    .ok_or_else(|| DbError::bad_request("new user data missing"))?;
                self.auth.create_user(
                    &payload.username,
                    &payload.password,
                    payload.role.unwrap_or(Role::User),
                    payload.permissions,
                )?;
                Ok(Response::message("USER_CREATED"))
            }

            CommandType::UpdateUserPassword => {
                let payload = req
                    .new_user
                    .ok_or_else(|| DbError::bad_request("user data missing"))?;
                self.auth.update_password(&payload.username, &payload.password)?;
                Ok(Response::message("USER_PASSWORD_UPDATED"))
            }

            CommandType::UpdateUserRole => {
                let payload = req
                    .new_user
                    .ok_or_else(|| DbError::bad_request("user data missing"))?;
                let role = payload
                    .role
                    .ok_or_else(|| DbError::bad_request("role missing"))?;
                self.auth.update_role(&payload.username, role)?;
                Ok(Response::message("USER_ROLE_UPDATED"))
            }

            CommandType::UpdateUserPermissions => {
                let payload = req
                    .new_user
                    .ok_or_else(|| DbError::bad_request("user data missing"))?;
                self.auth
                    .update_permissions(&payload.username, payload.permissions)?;
                Ok(Response::message("USER_PERMISSIONS_UPDATED"))
            }

            CommandType::DeleteUser => {
                let payload = req
                    .delete_user
                    .ok_or_else(|| DbError::bad_request("user data missing"))?;
                self.auth.delete_user(&payload.username)?;
                Ok(Response::message("USER_DELETED"))
            }

            CommandType::GetUser => {
                if req.data.is_empty() {
                    return Err(DbError::bad_request("username missing"));
                }
                let user = self.auth.get_user(&req.data)?;
                Ok(Response::message(summarize_user(&user)))
            }
        }
    }

    /// Permission gating, executed before dispatch
    fn authorize(&self, user: &User, command: CommandType, space: &str) -> Result<()> {
        match command {
            CommandType::CreateSpace
            | CommandType::DeleteSpace
            | CommandType::ListSpaces
            | CommandType::CreateUser
            | CommandType::DeleteUser
            | CommandType::UpdateUserPassword
            | CommandType::UpdateUserRole
            | CommandType::UpdateUserPermissions
            | CommandType::GetUser => {
                if !user.is_admin() {
                    return Err(DbError::forbidden("admin access required"));
                }
            }

            CommandType::Put | CommandType::Delete | CommandType::InsertVector => {
                if !self.auth.has_role(user, space, Permission::Write) {
                    return Err(DbError::forbidden("write permission denied"));
                }
            }

            CommandType::Get
            | CommandType::SearchTopk
            | CommandType::GetVector
            | CommandType::RangeSearch => {
                if !self.auth.has_role(user, space, Permission::Read) {
                    return Err(DbError::forbidden("read permission denied"));
                }
            }

            CommandType::UseSpace => {}
        }
        Ok(())
    }

    fn key_value_engine(&self, space: &str) -> Result<Arc<crate::kv::KvEngine>> {
        if space.is_empty() {
            return Err(DbError::bad_request("no space selected"));
        }
        match self.spaces.get_space(space)?.0 {
            Engine::KeyValue(engine) => Ok(engine),
            Engine::Vector(_) => Err(DbError::validation(
                "operation not supported: not a key-value space",
            )),
        }
    }

    fn vector_engine(&self, space: &str) -> Result<(Arc<crate::vector::VectorEngine>, usize)> {
        if space.is_empty() {
            return Err(DbError::bad_request("no space selected"));
        }
        let (engine, meta) = self.spaces.get_space(space)?;
        match engine {
            Engine::Vector(engine) => Ok((engine, meta.dimension)),
            Engine::KeyValue(_) => Err(DbError::validation(
                "operation not supported: not a vector space",
            )),
        }
    }
}

fn hits_response(hits: crate::vector::SearchHits) -> Response {
    Response::Hits(
        hits.ids
            .into_iter()
            .zip(hits.distances)
            .map(|(id, distance)| Hit { id, distance })
            .collect(),
    )
}

fn parse_vector_id(raw: &str) -> Result<i64> {
    raw.trim()
        .parse()
        .map_err(|_| DbError::bad_request("invalid vector id"))
}

/// Parse a comma-separated float list, enforcing the space dimension
fn parse_vector(raw: &str, dimension: usize) -> Result<Vec<f32>> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != dimension {
        return Err(DbError::validation(format!(
            "vector dimension mismatch: expected {dimension}, got {}",
            parts.len()
        )));
    }

    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            part.trim()
                .parse()
                .map_err(|_| DbError::validation(format!("invalid float at position {i}")))
        })
        .collect()
}

fn format_vector(vector: &[f32]) -> String {
    vector
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn summarize_user(user: &User) -> String {
    let role = match user.role {
        Role::Admin => "admin",
        Role::User => "user",
    };
    let permissions = if user.permissions.is_empty() {
        "None".to_string()
    } else {
        let mut pairs: Vec<String> = user
            .permissions
            .iter()
            .map(|(space, perm)| {
                let perm = match perm {
                    Permission::Read => "read",
                    Permission::Write => "write",
                };
                format!("{space}={perm}")
            })
            .collect();
        pairs.sort();
        pairs.join(", ")
    };
    format!(
        "Username: {} | Role: {role} | Permissions: {permissions}",
        user.username
    )
}
