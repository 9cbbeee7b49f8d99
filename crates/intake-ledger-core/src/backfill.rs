use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::schema::position_in;
use crate::{CounterStore, IdentifierAllocator, IntakeError, LedgerLocks, RowPosition, TableBackend, TableLayout};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowFailure {
    pub row_position: RowPosition,
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub table: String,
    pub rows_scanned: u64,
    pub rows_updated: u64,
    pub failures: Vec<RowFailure>,
}

/// Assigns identifiers to rows that never received them.
pub struct BackfillService<'a, B: TableBackend + ?Sized, C: CounterStore + ?Sized> {
    backend: &'a B,
    allocator: IdentifierAllocator<'a, B, C>,
}

impl<'a, B: TableBackend + ?Sized, C: CounterStore + ?Sized> BackfillService<'a, B, C> {
    #[must_use]
    pub fn new(backend: &'a B, counters: &'a C, locks: &'a LedgerLocks) -> Self {
        Self { backend, allocator: IdentifierAllocator::new(backend, counters, locks) }
    }

    /// Walk the table top to bottom and fill every blank identifier cell.
    ///
    /// A row that fails is recorded in the report and the walk continues.
    /// A second run over an unchanged table updates nothing.
    ///
    /// # Errors
    /// Returns an error only when the table itself cannot be read.
    pub fn repair_missing_identifiers(
        &self,
        layout: &TableLayout,
        now: OffsetDateTime,
    ) -> Result<BackfillReport, IntakeError> {
        let header = self.backend.read_header(&layout.name)?;
        let rows = self.backend.read_rows(&layout.name)?;
        let columns: Vec<Option<usize>> =
            layout.identifiers.iter().map(|spec| position_in(&header, &spec.column)).collect();

        let mut report = BackfillReport {
            table: layout.name.clone(),
            rows_scanned: 0,
            rows_updated: 0,
            failures: Vec::new(),
        };

        for (index, cells) in rows.iter().enumerate() {
            report.rows_scanned += 1;
            let complete = columns.iter().all(|column| {
                column.and_then(|column| cells.get(column)).is_some_and(|cell| !cell.is_blank())
            });
            if complete {
                continue;
            }

            let row = RowPosition(index as u64 + 1);
            match self.allocator.assign_identifiers(layout, row, now) {
                Ok(assigned) if !assigned.newly_assigned.is_empty() => report.rows_updated += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(table = %layout.name, %row, code = err.code(), error = %err, "backfill row failed");
                    report.failures.push(RowFailure {
                        row_position: row,
                        code: err.code().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            table = %report.table,
            rows_scanned = report.rows_scanned,
            rows_updated = report.rows_updated,
            failures = report.failures.len(),
            "identifier backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::memory::{MemoryBackend, MemoryCounterStore};
    use crate::CellValue;

    fn orders() -> TableLayout {
        TableLayout::standard("Orders", &[], &[])
    }

    #[test]
    fn second_pass_updates_nothing() -> Result<(), IntakeError> {
        let backend = MemoryBackend::new();
        backend.insert_header("Orders", &["Timestamp", "Vendor", "Historical ID"]);
        backend.push_raw_row("Orders", vec![CellValue::from("t1"), CellValue::from("A"), CellValue::Integer(5)]);
        backend.push_raw_row("Orders", vec![CellValue::from("t2"), CellValue::from("B")]);
        backend.push_raw_row("Orders", vec![CellValue::from("t3"), CellValue::from("C"), CellValue::from("")]);
        let counters = MemoryCounterStore::new();
        let locks = LedgerLocks::new();
        let service = BackfillService::new(&backend, &counters, &locks);
        let now = datetime!(2026-06-15 10:00 UTC);

        let first = service.repair_missing_identifiers(&orders(), now)?;
        assert_eq!((first.rows_scanned, first.rows_updated), (3, 3));
        assert!(first.failures.is_empty());

        let historical: Vec<Option<u64>> = backend
            .read_column("Orders", 2)?
            .iter()
            .map(CellValue::as_identifier)
            .collect();
        assert_eq!(historical, vec![Some(5), Some(6), Some(7)]);
        let semester = backend.read_column("Orders", 4)?;
        assert!(semester.iter().all(|cell| *cell == CellValue::from("Summer 2026")));

        let second = service.repair_missing_identifiers(&orders(), now)?;
        assert_eq!((second.rows_scanned, second.rows_updated), (3, 0));
        Ok(())
    }

    #[test]
    fn repair_alongside_live_assignment_keeps_identifiers_unique() -> Result<(), IntakeError> {
        const ROWS: u64 = 40;
        let layout = orders();
        let now = datetime!(2026-03-02 08:00 UTC);

        for _round in 0..10 {
            let backend = MemoryBackend::new();
            backend.insert_header("Orders", &["Timestamp", "Vendor"]);
            for index in 0..ROWS {
                backend.push_raw_row(
                    "Orders",
                    vec![CellValue::from("t"), CellValue::from(format!("vendor-{index}").as_str())],
                );
            }
            let counters = MemoryCounterStore::new();
            let locks = LedgerLocks::new();

            std::thread::scope(|scope| -> Result<(), IntakeError> {
                let repairs: Vec<_> = (0..3)
                    .map(|_| {
                        scope.spawn(|| {
                            BackfillService::new(&backend, &counters, &locks)
                                .repair_missing_identifiers(&layout, now)
                        })
                    })
                    .collect();
                let assigner = scope.spawn(|| -> Result<(), IntakeError> {
                    let allocator = IdentifierAllocator::new(&backend, &counters, &locks);
                    for row in (1..=ROWS).rev() {
                        allocator.assign_identifiers(&layout, RowPosition(row), now)?;
                    }
                    Ok(())
                });

                for repair in repairs {
                    let report = repair
                        .join()
                        .unwrap_or_else(|_| panic!("repair thread panicked"))?;
                    assert!(report.failures.is_empty(), "failures: {:?}", report.failures);
                }
                assigner.join().unwrap_or_else(|_| panic!("assigner thread panicked"))
            })?;

            let header = backend.read_header("Orders")?;
            for column_name in ["Historical ID", "Submission ID"] {
                let column = position_in(&header, column_name)
                    .unwrap_or_else(|| panic!("missing column {column_name} in {header:?}"));
                let mut values: Vec<u64> = backend
                    .read_column("Orders", column)?
                    .iter()
                    .map(|cell| {
                        cell.as_identifier()
                            .unwrap_or_else(|| panic!("blank {column_name} cell: {cell:?}"))
                    })
                    .collect();
                assert_eq!(values.len() as u64, ROWS);
                values.sort_unstable();
                values.dedup();
                assert_eq!(values.len() as u64, ROWS, "duplicate {column_name} values");
            }
            let semester = position_in(&header, "Semester")
                .unwrap_or_else(|| panic!("missing Semester column in {header:?}"));
            assert!(backend
                .read_column("Orders", semester)?
                .iter()
                .all(|cell| *cell == CellValue::from("Spring 2026")));

            let rerun = BackfillService::new(&backend, &counters, &locks)
                .repair_missing_identifiers(&layout, now)?;
            assert_eq!((rerun.rows_scanned, rerun.rows_updated), (ROWS, 0));
        }
        Ok(())
    }

    #[test]
    fn empty_table_reports_zero_rows() -> Result<(), IntakeError> {
        let backend = MemoryBackend::new();
        let counters = MemoryCounterStore::new();
        let locks = LedgerLocks::new();
        let report = BackfillService::new(&backend, &counters, &locks)
            .repair_missing_identifiers(&orders(), datetime!(2026-06-15 10:00 UTC))?;
        assert_eq!((report.rows_scanned, report.rows_updated), (0, 0));
        Ok(())
    }

    #[test]
    fn counter_contention_is_collected_per_row() -> Result<(), IntakeError> {
        struct AlwaysLosing;
        impl CounterStore for AlwaysLosing {
            fn get(&self, _key: &crate::CounterKey) -> Result<Option<u64>, IntakeError> {
                Ok(None)
            }
            fn compare_and_set(
                &self,
                _key: &crate::CounterKey,
                _expected: Option<u64>,
                _new: u64,
            ) -> Result<bool, IntakeError> {
                Ok(false)
            }
            fn remove(&self, _key: &crate::CounterKey) -> Result<(), IntakeError> {
                Ok(())
            }
        }

        let backend = MemoryBackend::new();
        backend.insert_header("Orders", &["Timestamp"]);
        backend.push_raw_row("Orders", vec![CellValue::from("t1")]);
        backend.push_raw_row("Orders", vec![CellValue::from("t2")]);
        let locks = LedgerLocks::new();
        let report = BackfillService::new(&backend, &AlwaysLosing, &locks)
            .repair_missing_identifiers(&orders(), datetime!(2026-06-15 10:00 UTC))?;

        assert_eq!(report.rows_scanned, 2);
        assert_eq!(report.rows_updated, 0);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|failure| failure.code == "COUNTER_CONTENTION"));
        Ok(())
    }
}
