pub mod auth;

pub use auth::{auth_middleware, issue_token, rate_limit_middleware, Claims, EventRoleClaim, Role};
