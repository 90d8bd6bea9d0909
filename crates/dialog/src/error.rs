use snafu::Snafu;

use parley_store::StoreError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DialogError {
    #[snafu(display("initial history load failed after {attempts} attempts: {source}"))]
    InitialLoadFailed { attempts: u32, source: StoreError },
    #[snafu(display("loading older history failed: {source}"))]
    PaginationFailed { source: StoreError },
    #[snafu(display("{action} failed: {source}"))]
    MutationFailed {
        action: &'static str,
        source: StoreError,
    },
    #[snafu(display("no conversation is selected"))]
    NoConversationSelected { stage: &'static str },
    #[snafu(display("dialog worker is gone"))]
    WorkerGone { stage: &'static str },
}

pub type DialogResult<T> = Result<T, DialogError>;
