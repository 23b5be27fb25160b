//! HTTP control API (§10.6): the language-neutral control surface an
//! external collaborator (a desktop shell) drives the supervisor through.

pub mod handlers;
pub mod routes;

pub use routes::create_router;
