use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Upper bound on pages per fetch, so a misbehaving source cannot loop forever.
pub const DEFAULT_MAX_PAGES: u32 = 10_000;

/// Position of the next page to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Start,
    Offset(u64),
    Link(String),
    Composite(String),
}

/// What a page says about the rest of the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageHint {
    /// Nothing follows.
    End,
    /// Offset paging. Without a total, a short page ends the listing.
    Offset { page_size: u64, total: Option<u64> },
    /// Next-link paging.
    Link(String),
    /// Opaque cursor paging with an explicit has-more flag.
    Cursor { value: String, has_more: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub rows: Vec<Value>,
    pub next: PageHint,
}

impl Page {
    pub fn last(rows: Vec<Value>) -> Self {
        Self {
            rows,
            next: PageHint::End,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    pub rows: Vec<Value>,
    pub request_count: u64,
}

impl FetchResult {
    pub fn merge(&mut self, other: FetchResult) {
        self.rows.extend(other.rows);
        self.request_count += other.request_count;
    }
}

/// Something that can produce one page for a cursor. Sources may keep state
/// between pages (e.g. switching to a fallback request shape).
#[async_trait]
pub trait PageSource: Send {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page>;
}

/// Drives a `PageSource` to completion. All or nothing: any page failure
/// discards the rows read so far.
#[derive(Debug, Clone, Copy)]
pub struct PaginatedFetcher {
    max_pages: u32,
}

impl Default for PaginatedFetcher {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
        }
    }
}

impl PaginatedFetcher {
    pub fn new(max_pages: u32) -> Self {
        Self { max_pages }
    }

    pub async fn fetch_all<S: PageSource + ?Sized>(&self, source: &mut S) -> Result<FetchResult> {
        let mut rows = Vec::new();
        let mut cursor = PageCursor::Start;
        let mut request_count = 0u64;

        loop {
            if request_count >= self.max_pages as u64 {
                return Err(Error::Pagination(format!(
                    "stopped after {} pages without reaching the end",
                    self.max_pages
                )));
            }

            let page = source.fetch_page(&cursor).await?;
            request_count += 1;
            let page_len = page.rows.len() as u64;
            rows.extend(page.rows);

            cursor = match page.next {
                PageHint::End => break,
                PageHint::Offset { page_size, total } => {
                    let current = match cursor {
                        PageCursor::Offset(n) => n,
                        _ => 0,
                    };
                    let next = current + page_size;
                    let done = page_len == 0
                        || match total {
                            Some(total) => next >= total,
                            None => page_len < page_size,
                        };
                    if done {
                        break;
                    }
                    PageCursor::Offset(next)
                }
                PageHint::Link(link) => {
                    if cursor == PageCursor::Link(link.clone()) {
                        return Err(Error::Pagination(format!(
                            "same next link for consecutive pages: {}",
                            crate::http::retry::redact(&link)
                        )));
                    }
                    PageCursor::Link(link)
                }
                PageHint::Cursor { value, has_more } => {
                    if cursor == PageCursor::Composite(value.clone()) {
                        return Err(Error::Pagination(format!(
                            "same offset for consecutive pages: {value}"
                        )));
                    }
                    if !has_more {
                        break;
                    }
                    PageCursor::Composite(value)
                }
            };
        }

        Ok(FetchResult {
            rows,
            request_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Replays canned pages and records the cursors it was asked for.
    struct Scripted {
        pages: Vec<Result<Page>>,
        seen: Vec<PageCursor>,
    }

    impl Scripted {
        fn new(pages: Vec<Result<Page>>) -> Self {
            Self {
                pages: pages.into_iter().rev().collect(),
                seen: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl PageSource for Scripted {
        async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
            self.seen.push(cursor.clone());
            self.pages
                .pop()
                .unwrap_or_else(|| Err(Error::Other("no more scripted pages".into())))
        }
    }

    fn rows(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "id": i })).collect()
    }

    #[tokio::test]
    async fn test_offset_with_total() {
        let hint = |total| PageHint::Offset {
            page_size: 2,
            total: Some(total),
        };
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(2), next: hint(5) }),
            Ok(Page { rows: rows(2), next: hint(5) }),
            Ok(Page { rows: rows(1), next: hint(5) }),
        ]);
        let result = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap();
        assert_eq!(result.rows.len(), 5);
        assert_eq!(result.request_count, 3);
        assert_eq!(
            source.seen,
            vec![PageCursor::Start, PageCursor::Offset(2), PageCursor::Offset(4)]
        );
    }

    #[tokio::test]
    async fn test_offset_short_page_ends() {
        let hint = PageHint::Offset {
            page_size: 3,
            total: None,
        };
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(3), next: hint.clone() }),
            Ok(Page { rows: rows(1), next: hint }),
        ]);
        let result = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap();
        assert_eq!(result.rows.len(), 4);
        assert_eq!(result.request_count, 2);
    }

    #[tokio::test]
    async fn test_offset_empty_page_ends() {
        let mut source = Scripted::new(vec![Ok(Page {
            rows: vec![],
            next: PageHint::Offset {
                page_size: 200,
                total: Some(1000),
            },
        })]);
        let result = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.request_count, 1);
    }

    #[tokio::test]
    async fn test_next_link() {
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(2), next: PageHint::Link("https://x/p2".into()) }),
            Ok(Page { rows: rows(2), next: PageHint::Link("https://x/p3".into()) }),
            Ok(Page::last(rows(1))),
        ]);
        let result = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap();
        assert_eq!(result.rows.len(), 5);
        assert_eq!(source.seen[2], PageCursor::Link("https://x/p3".into()));
    }

    #[tokio::test]
    async fn test_repeated_link_is_error() {
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(1), next: PageHint::Link("https://x/p2".into()) }),
            Ok(Page { rows: rows(1), next: PageHint::Link("https://x/p2".into()) }),
        ]);
        let err = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap_err();
        assert!(matches!(err, Error::Pagination(_)));
    }

    #[tokio::test]
    async fn test_cursor_has_more() {
        let cursor = |v: &str, more| PageHint::Cursor {
            value: v.into(),
            has_more: more,
        };
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(2), next: cursor("a", true) }),
            Ok(Page { rows: rows(2), next: cursor("b", false) }),
        ]);
        let result = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap();
        assert_eq!(result.rows.len(), 4);
        assert_eq!(source.seen, vec![PageCursor::Start, PageCursor::Composite("a".into())]);
    }

    #[tokio::test]
    async fn test_repeated_cursor_is_terminal() {
        let cursor = PageHint::Cursor {
            value: "vid=5|time=10".into(),
            has_more: true,
        };
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(2), next: cursor.clone() }),
            Ok(Page { rows: rows(2), next: cursor }),
        ]);
        let err = PaginatedFetcher::default().fetch_all(&mut source).await.unwrap_err();
        assert!(err.to_string().contains("same offset"));
        // Exactly two requests: no retry of the repeated page
        assert_eq!(source.seen.len(), 2);
    }

    #[tokio::test]
    async fn test_page_failure_discards_rows() {
        let mut source = Scripted::new(vec![
            Ok(Page { rows: rows(2), next: PageHint::Link("https://x/p2".into()) }),
            Err(Error::Api { status: 400, body: "bad".into() }),
        ]);
        let result = PaginatedFetcher::default().fetch_all(&mut source).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_max_pages_guard() {
        let pages = (0..10)
            .map(|i| {
                Ok(Page {
                    rows: rows(1),
                    next: PageHint::Link(format!("https://x/p{}", i + 2)),
                })
            })
            .collect();
        let mut source = Scripted::new(pages);
        let err = PaginatedFetcher::new(3).fetch_all(&mut source).await.unwrap_err();
        assert!(matches!(err, Error::Pagination(_)));
        assert_eq!(source.seen.len(), 3);
    }
}
