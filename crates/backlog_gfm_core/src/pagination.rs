use std::marker::PhantomData;

use anyhow::Result;

/// Lazy offset/count paginator.
///
/// Calls `fetch(offset, count)` once per `next()` and stops after the first
/// empty or short page, or right after yielding an error. The sequence is
/// finite; restart it by building a new `Pages`.
pub struct Pages<T, F> {
    fetch: F,
    offset: usize,
    page_size: usize,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T, F> Pages<T, F>
where
    F: FnMut(usize, usize) -> Result<Vec<T>>,
{
    pub fn new(page_size: usize, fetch: F) -> Self {
        Self {
            fetch,
            offset: 0,
            page_size: page_size.max(1),
            done: false,
            _item: PhantomData,
        }
    }
}

impl<T, F> Iterator for Pages<T, F>
where
    F: FnMut(usize, usize) -> Result<Vec<T>>,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match (self.fetch)(self.offset, self.page_size) {
            Ok(page) => {
                if page.is_empty() {
                    self.done = true;
                    return None;
                }
                if page.len() < self.page_size {
                    self.done = true;
                }
                self.offset += page.len();
                Some(Ok(page))
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

/// Drain every page into one vector, failing on the first page error.
pub fn collect_all<T, F>(page_size: usize, fetch: F) -> Result<Vec<T>>
where
    F: FnMut(usize, usize) -> Result<Vec<T>>,
{
    let mut items = Vec::new();
    for page in Pages::new(page_size, fetch) {
        items.extend(page?);
    }
    Ok(items)
}
