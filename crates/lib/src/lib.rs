//! chatfuse core library: chat sessions, credentials, persistence and the streaming send
//! pipeline shared by every front end.

pub mod app;
pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod credentials;
pub mod init;
pub mod llm;
pub mod local;
pub mod model;
pub mod pipeline;
pub mod preferences;
pub mod session;
pub mod store;
