//! Page sources: exhaustible producers of item batches
//!
//! A [`PageSource`] is polled by exactly one caller at a time (the
//! [`Prefetcher`](crate::Prefetcher) enforces this). An empty page is a
//! permanent exhaustion signal; an `Err` is a fetch failure and is never
//! mistaken for exhaustion.

use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use tracing::debug;

/// An ordered batch of items; empty means the source is exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    items: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> From<Vec<T>> for Page<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

/// Produces successive pages from an externally-defined source.
///
/// Implementations may perform I/O and mutate their cursor. After returning
/// an empty page they need not tolerate being polled again.
#[async_trait]
pub trait PageSource<T>: Send {
    async fn poll(&mut self) -> anyhow::Result<Page<T>>;
}

/// Position of a page in a paged query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub number: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn new(number: usize, size: usize) -> Self {
        Self { number, size }
    }

    pub fn offset(&self) -> usize {
        self.number * self.size
    }

    pub fn next(&self) -> Self {
        Self {
            number: self.number + 1,
            size: self.size,
        }
    }
}

/// One page of a database query result.
#[derive(Debug, Clone)]
pub struct DbPage<T> {
    pub content: Vec<T>,
    pub has_next: bool,
}

impl<T> DbPage<T> {
    pub fn new(content: Vec<T>, has_next: bool) -> Self {
        Self { content, has_next }
    }

    pub fn last(content: Vec<T>) -> Self {
        Self::new(content, false)
    }
}

pub const DEFAULT_DB_PAGE_SIZE: usize = 10;

/// Walks a page-number/page-size query until it reports no next page or the
/// configured last page is passed.
pub struct DbPageSource<T, F> {
    query: F,
    page_size: usize,
    cursor: Option<PageRequest>,
    last_page: Option<usize>,
    _item: PhantomData<fn() -> T>,
}

impl<T, F, Fut> DbPageSource<T, F>
where
    F: FnMut(PageRequest) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<DbPage<T>>> + Send,
    T: Send,
{
    pub fn new(query: F) -> Self {
        Self::with_page_size(DEFAULT_DB_PAGE_SIZE, query)
    }

    pub fn with_page_size(page_size: usize, query: F) -> Self {
        Self {
            query,
            page_size,
            cursor: Some(PageRequest::new(0, page_size)),
            last_page: None,
            _item: PhantomData,
        }
    }

    pub fn starting_at(mut self, page: usize) -> Self {
        self.set_current_page(page);
        self
    }

    /// Stop after page `last_page` (inclusive) even if the query has more.
    pub fn with_last_page(mut self, last_page: usize) -> Self {
        self.last_page = Some(last_page);
        self
    }

    pub fn set_current_page(&mut self, page: usize) {
        self.cursor = Some(PageRequest::new(page, self.page_size));
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn current_page(&self) -> Option<usize> {
        self.cursor.map(|c| c.number)
    }
}

#[async_trait]
impl<T, F, Fut> PageSource<T> for DbPageSource<T, F>
where
    F: FnMut(PageRequest) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<DbPage<T>>> + Send,
    T: Send,
{
    async fn poll(&mut self) -> anyhow::Result<Page<T>> {
        let request = match self.cursor {
            Some(request) => request,
            None => return Ok(Page::empty()),
        };

        if let Some(last_page) = self.last_page {
            if request.number > last_page {
                debug!("Page {} is past the last page {}", request.number, last_page);
                self.cursor = None;
                return Ok(Page::empty());
            }
        }

        debug!("Querying page {} (size {})", request.number, request.size);
        let page = (self.query)(request).await?;
        self.cursor = page.has_next.then(|| request.next());

        Ok(Page::new(page.content))
    }
}

/// Wraps an arbitrary "fetch next batch" action, such as clicking a "next"
/// link and scraping the resulting list.
pub struct ActionPageSource<T, F> {
    action: F,
    exhausted: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T, F, Fut> ActionPageSource<T, F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<Vec<T>>> + Send,
    T: Send,
{
    pub fn new(action: F) -> Self {
        Self {
            action,
            exhausted: false,
            _item: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> PageSource<T> for ActionPageSource<T, F>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = anyhow::Result<Vec<T>>> + Send,
    T: Send,
{
    async fn poll(&mut self) -> anyhow::Result<Page<T>> {
        if self.exhausted {
            return Ok(Page::empty());
        }

        let items = (self.action)().await?;
        if items.is_empty() {
            self.exhausted = true;
        }

        Ok(Page::new(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn table(rows: usize) -> Arc<Vec<usize>> {
        Arc::new((1..=rows).collect())
    }

    fn query_table(
        rows: Arc<Vec<usize>>,
        calls: Arc<Mutex<Vec<usize>>>,
    ) -> impl FnMut(PageRequest) -> futures::future::Ready<anyhow::Result<DbPage<usize>>> + Send
    {
        move |request: PageRequest| {
            calls.lock().unwrap().push(request.number);
            let content: Vec<usize> = rows
                .iter()
                .skip(request.offset())
                .take(request.size)
                .copied()
                .collect();
            let has_next = request.offset() + request.size < rows.len();
            futures::future::ready(Ok(DbPage::new(content, has_next)))
        }
    }

    #[tokio::test]
    async fn db_source_walks_pages_until_no_next() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut source = DbPageSource::with_page_size(2, query_table(table(5), calls.clone()));

        assert_eq!(source.poll().await.unwrap().into_items(), vec![1, 2]);
        assert_eq!(source.poll().await.unwrap().into_items(), vec![3, 4]);
        assert_eq!(source.poll().await.unwrap().into_items(), vec![5]);
        assert!(source.poll().await.unwrap().is_empty());
        assert!(source.poll().await.unwrap().is_empty());

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(source.current_page(), None);
    }

    #[tokio::test]
    async fn db_source_respects_start_and_last_page() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut source = DbPageSource::with_page_size(2, query_table(table(20), calls.clone()))
            .starting_at(1)
            .with_last_page(2);

        assert_eq!(source.poll().await.unwrap().into_items(), vec![3, 4]);
        assert_eq!(source.poll().await.unwrap().into_items(), vec![5, 6]);
        assert!(source.poll().await.unwrap().is_empty());

        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn db_source_propagates_query_errors() {
        let mut source = DbPageSource::new(|_request: PageRequest| async {
            Err::<DbPage<u32>, _>(anyhow::anyhow!("connection reset"))
        });

        let err = source.poll().await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        assert_eq!(source.page_size(), DEFAULT_DB_PAGE_SIZE);
    }

    #[tokio::test]
    async fn action_source_latches_after_empty_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut source = ActionPageSource::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok(vec![n * 10, n * 10 + 1])
                } else {
                    Ok(Vec::new())
                }
            }
        });

        assert_eq!(source.poll().await.unwrap().len(), 2);
        assert_eq!(source.poll().await.unwrap().len(), 2);
        assert!(source.poll().await.unwrap().is_empty());
        assert!(source.poll().await.unwrap().is_empty());

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn page_request_offsets() {
        let request = PageRequest::new(3, 20);
        assert_eq!(request.offset(), 60);
        assert_eq!(request.next(), PageRequest::new(4, 20));
    }
}
