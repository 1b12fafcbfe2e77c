mod tests_read_write;
