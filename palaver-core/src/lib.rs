pub mod auth;
pub mod compress;
pub mod xml;
pub mod xmpp;
