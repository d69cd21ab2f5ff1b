//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 连接接入应用层会话，HTTP 接口提供历史记录、
//! 文件下载与通话信令。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
