mod tests_manager;
mod tests_merger;
mod tests_purge;
