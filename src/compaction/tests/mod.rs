mod tests_leveled;
mod tests_purge;
