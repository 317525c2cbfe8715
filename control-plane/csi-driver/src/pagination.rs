use snafu::Snafu;

/// Pagination errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum PaginationError {
    #[snafu(display("max_entries must not be negative, got {max_entries}"))]
    NegativeMaxEntries { max_entries: i32 },
    #[snafu(display("Invalid starting_token '{token}', no such entry"))]
    InvalidToken { token: String },
}

impl From<PaginationError> for tonic::Status {
    fn from(error: PaginationError) -> Self {
        match error {
            PaginationError::NegativeMaxEntries { .. } => {
                tonic::Status::invalid_argument(error.to_string())
            }
            PaginationError::InvalidToken { .. } => tonic::Status::aborted(error.to_string()),
        }
    }
}

/// A page of list results.
#[derive(Debug, PartialEq, Eq)]
pub struct Page<T> {
    pub entries: Vec<T>,
    /// Key of the first entry of the next page, empty when this is the last page.
    pub next_token: String,
}

/// Cut a page out of `entries`, which must be sorted in a stable order.
///
/// A non-empty `starting_token` is the key of the first entry to return, and it must be one
/// of the keys. A `max_entries` of 0 means no limit.
pub fn paginate<T>(
    entries: Vec<T>,
    key: impl Fn(&T) -> &str,
    starting_token: &str,
    max_entries: i32,
) -> Result<Page<T>, PaginationError> {
    if max_entries < 0 {
        return Err(PaginationError::NegativeMaxEntries { max_entries });
    }
    let start = match starting_token {
        "" => 0,
        token => entries
            .iter()
            .position(|entry| key(entry) == token)
            .ok_or_else(|| PaginationError::InvalidToken {
                token: token.to_string(),
            })?,
    };
    let mut entries = entries.into_iter().skip(start).collect::<Vec<_>>();
    let max_entries = max_entries as usize;
    let next_token = match max_entries {
        0 => String::new(),
        max if entries.len() > max => {
            let rest = entries.split_off(max);
            rest.first().map(|e| key(e).to_string()).unwrap_or_default()
        }
        _ => String::new(),
    };
    Ok(Page {
        entries,
        next_token,
    })
}
