mod tests_bucketing;
