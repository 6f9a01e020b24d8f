//! Utility
//!
//! **This module is exempt from the API stability guarantee.** It's exposed
//! only because kernel objects built on it need to be nameable in `static`
//! items.
mod init;
pub(crate) mod intrusive_list;
pub use self::init::Init;
