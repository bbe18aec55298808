//! Row garbage collection.

#[cfg(test)]
mod tests {
    use crate::row::{CellKind, Mutation};

    /// # Scenario
    /// When the predicate forbids purging, tombstones survive but shadowed
    /// cells are still dropped and expired cells become tombstones.
    ///
    /// # Expected behavior
    /// - `shadowed == 1`, `expired == 1`, nothing purged.
    /// - The expired cell keeps its write time as deletion time.
    #[test]
    fn purge_blocked_keeps_markers() {
        let (_, mut row) = Mutation::new("k")
            .add("a", "hidden", 1)
            .add_expiring("b", "gone", 10, 5)
            .delete_cell("c", 10)
            .delete_row(2)
            .with_local_time(100)
            .into_row();

        let stats = row.purge(200, |_, _| false);
        assert_eq!(stats.shadowed, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.purged_cells, 0);
        assert!(!stats.purged_row_deletion);

        assert_eq!(row.cells.len(), 2);
        assert_eq!(
            row.cells[0].kind,
            CellKind::Tombstone {
                local_deletion_time: 100
            }
        );
        assert!(row.cells[0].value.is_empty());
        assert!(row.deletion.is_some());
    }

    /// # Scenario
    /// A permissive predicate drops every deletion marker and leaves an
    /// empty row.
    #[test]
    fn purge_allowed_empties_row() {
        let (_, mut row) = Mutation::new("k")
            .delete_cell("c", 10)
            .delete_row(20)
            .with_local_time(100)
            .into_row();

        let stats = row.purge(200, |_, _| true);
        assert_eq!(stats.purged_cells, 1);
        assert!(stats.purged_row_deletion);
        assert!(row.is_empty());
    }

    /// # Scenario
    /// The predicate receives each marker's own timestamp and deletion
    /// time, so markers can be judged individually.
    #[test]
    fn purge_predicate_is_per_marker() {
        let (_, mut row) = Mutation::new("k")
            .delete_cell("old", 3)
            .delete_cell("new", 30)
            .with_local_time(100)
            .into_row();

        row.purge(200, |timestamp, ldt| timestamp < 10 && ldt == 100);
        assert_eq!(row.cells.len(), 1);
        assert_eq!(row.cells[0].name, b"new");
    }

    /// # Scenario
    /// Unexpired TTL cells are live data, not markers to purge.
    #[test]
    fn unexpired_ttl_cell_is_untouched() {
        let (_, mut row) = Mutation::new("k")
            .add_expiring("t", "v", 1, 1_000)
            .with_local_time(100)
            .into_row();

        let stats = row.purge(200, |_, _| true);
        assert_eq!(stats.expired, 0);
        assert_eq!(row.cells.len(), 1);
        assert!(row.has_deletions());
        assert_eq!(row.deletion_points().collect::<Vec<_>>(), vec![1_100]);
    }
}
