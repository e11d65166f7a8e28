//! Built-in action handlers for TestMesh flows.
//!
//! Each handler implements the [`ActionHandler`] contract from
//! `testmesh-core`:
//! - `http_request`, `websocket`, `grpc` - protocol calls
//! - `database_query`, `db_poll` - SQL against Postgres DSNs
//! - `kafka.produce`, `kafka.consume` - Kafka messaging
//! - `delay`, `log`, `transform`, `assert`, `wait_for` - flow utilities

pub mod assert;
pub mod db_poll;
pub mod delay;
pub mod grpc;
pub mod http;
pub mod kafka;
pub mod log;
pub mod sql;
pub mod transform;
pub mod wait_for;
pub mod websocket;

use std::sync::Arc;

use testmesh_core::handler::ActionHandler;

pub use assert::AssertHandler;
pub use db_poll::DbPollHandler;
pub use delay::DelayHandler;
pub use grpc::GrpcHandler;
pub use http::HttpRequestHandler;
pub use kafka::{KafkaConsumeHandler, KafkaProduceHandler};
pub use log::LogHandler;
pub use sql::DatabaseQueryHandler;
pub use transform::TransformHandler;
pub use wait_for::WaitForHandler;
pub use websocket::WebsocketHandler;

/// The full built-in handler set, ready for the dispatcher.
pub fn builtin_handlers() -> Vec<Arc<dyn ActionHandler>> {
    let sql_pools = sql::PgPoolCache::shared();
    vec![
        Arc::new(HttpRequestHandler::new()),
        Arc::new(DatabaseQueryHandler::with_pools(sql_pools.clone())),
        Arc::new(DelayHandler),
        Arc::new(LogHandler),
        Arc::new(TransformHandler),
        Arc::new(AssertHandler),
        Arc::new(KafkaProduceHandler::new()),
        Arc::new(KafkaConsumeHandler),
        Arc::new(WebsocketHandler::new()),
        Arc::new(GrpcHandler),
        Arc::new(WaitForHandler::new()),
        Arc::new(DbPollHandler::with_pools(sql_pools)),
    ]
}
