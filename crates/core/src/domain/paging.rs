use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// 1-based page request. Out-of-range values are clamped rather than rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self::bounded(page, page_size, MAX_PAGE_SIZE)
    }

    pub fn bounded(page: u32, page_size: u32, max_page_size: u32) -> Self {
        Self { page: page.max(1), page_size: page_size.clamp(1, max_page_size.max(1)) }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u32 {
        self.page_size
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total_items: u64,
    pub total_pages: u64,
}

impl<T> PagedResult<T> {
    pub fn new(items: Vec<T>, request: PageRequest, total_items: u64) -> Self {
        Self {
            items,
            page: request.page,
            page_size: request.page_size,
            total_items,
            total_pages: total_items.div_ceil(u64::from(request.page_size)),
        }
    }

    /// Slices an already ordered, fully materialized result set.
    pub fn from_ordered(all: Vec<T>, request: PageRequest) -> Self {
        let total_items = all.len() as u64;
        let offset = usize::try_from(request.offset()).unwrap_or(usize::MAX);
        let items = all.into_iter().skip(offset).take(request.limit() as usize).collect();
        Self::new(items, request, total_items)
    }

    pub fn has_next_page(&self) -> bool {
        u64::from(self.page) < self.total_pages
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PagedResult<U> {
        PagedResult {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            page_size: self.page_size,
            total_items: self.total_items,
            total_pages: self.total_pages,
        }
    }
}
