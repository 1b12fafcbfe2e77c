mod tests_pools;
