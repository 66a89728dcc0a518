mod helpers;
mod tests_evict;
