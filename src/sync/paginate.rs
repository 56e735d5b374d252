use log::warn;
use std::future::Future;
use std::marker::PhantomData;

use crate::error::Result;
use crate::providers::{Page, PageRequest};

/// GitLab caps `per_page` at 100.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Walks a page-numbered list endpoint from page 1.
///
/// The walk ends when the provider reports no next page, or a next page that
/// does not advance past the current one. A failed request also ends the
/// walk; the error is returned to the caller, which decides whether it is
/// worth more than a log line.
pub struct PageWalker<T, F> {
    fetch: F,
    per_page: u32,
    next: Option<u32>,
    current: Option<u32>,
    requests: usize,
    _item: PhantomData<fn() -> T>,
}

impl<T, F, Fut> PageWalker<T, F>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    pub fn new(per_page: u32, fetch: F) -> Self {
        Self {
            fetch,
            per_page,
            next: Some(1),
            current: None,
            requests: 0,
            _item: PhantomData,
        }
    }

    /// Fetches the next page, or returns `None` once the walk is over.
    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        let Some(page) = self.next.take() else {
            return Ok(None);
        };

        self.requests += 1;
        self.current = Some(page);
        let response = (self.fetch)(PageRequest {
            page,
            per_page: self.per_page,
        })
        .await?;

        self.next = match response.next_page {
            Some(next) if next > page => Some(next),
            Some(next) if next != 0 => {
                warn!("Provider returned non-advancing next page current={page} next={next}, stopping");
                None
            }
            _ => None,
        };

        Ok(Some(response.items))
    }

    /// Page number of the most recent request, `None` before the first one.
    pub fn current_page(&self) -> Option<u32> {
        self.current
    }

    /// Number of page requests issued so far.
    pub fn requests(&self) -> usize {
        self.requests
    }
}
