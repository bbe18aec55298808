mod tests_purge;
