mod tests_deadlock;
mod tests_grant;
