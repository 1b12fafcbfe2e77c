mod tests_cells;
mod tests_deletion;
