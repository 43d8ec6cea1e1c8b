pub mod approval;
pub mod paging;
