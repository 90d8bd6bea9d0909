//! Conversation dialog controller for the tutoring-marketplace console.
//!
//! Reconciles three message sources into one consistent view per selected
//! conversation: paged history from the store, a live push feed over the
//! most recent window, and local send/edit/delete mutations.

pub mod config;
pub mod dialog;
pub mod error;
pub mod history;
pub mod identity;
pub mod media;
pub mod state;

pub use config::DialogConfig;
pub use dialog::DialogHandle;
pub use error::{DialogError, DialogResult};
pub use identity::IdentityDirectory;
pub use media::MediaLocator;
pub use state::{DialogState, LoadPhase};
