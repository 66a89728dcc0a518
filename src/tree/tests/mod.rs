mod helpers;
mod tests_search;
