//! Concurrent writers.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use crate::memtable::Memtable;
    use crate::row::Mutation;

    /// # Scenario
    /// Several threads write disjoint cells of the same rows.
    ///
    /// # Expected behavior
    /// Every row ends up with one cell per writer; no update is lost.
    #[test]
    fn concurrent_writers_lose_nothing() {
        let mem = Arc::new(Memtable::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mem = Arc::clone(&mem);
                thread::spawn(move || {
                    for i in 0..100 {
                        let (k, r) = Mutation::new(format!("row{i:03}"))
                            .add(format!("w{t}"), "v", i64::from(i))
                            .into_row();
                        mem.apply(k, r).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(mem.len().unwrap(), 100);
        for (_, row) in mem.snapshot().unwrap() {
            assert_eq!(row.cells.len(), 4);
        }
    }
}
