//! OAuth 2.0 + PKCE against the auth gateway

pub mod flow;
pub mod listener;
pub mod pkce;

pub use flow::{AuthorizeRequest, BrowserOpener, OAuthFlow, SystemBrowser, TokenEndpointResponse};
pub use listener::{CallbackListener, CallbackQuery};
pub use pkce::{generate_state, is_valid_state, PkcePair};
