/// Offset/limit window over an ordered result list.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Page {
    pub offset: usize,
    /// `None` returns everything after `offset`.
    pub limit: Option<usize>,
}

impl Page {
    pub const fn all() -> Self {
        Self {
            offset: 0,
            limit: None,
        }
    }

    pub const fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// Request-style paging where any negative limit means "no limit".
    pub fn from_raw(offset: usize, limit: i64) -> Self {
        Self {
            offset,
            limit: usize::try_from(limit).ok(),
        }
    }

    pub fn apply<I: Iterator>(self, items: I) -> impl Iterator<Item = I::Item> {
        items
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
    }
}
