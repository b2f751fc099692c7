pub mod jid;
pub mod part;
pub mod stanza;
pub mod stream;
pub mod stream_header;
