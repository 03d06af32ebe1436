// 🚚 Ingestion Pipeline - one CSV submission, one transaction
//
// Row validation failures and constraint violations are soft: they are
// counted, described and the loop moves on. Structural failures abort before
// any row work. Infrastructure failures roll back every write of the batch.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{AuditSink, SqliteAuditSink};
use crate::ledger::{UploadLedger, UploadState};
use crate::resolver::{PersonRegistry, PersonResolver, RegistryError, Resolution, SqlitePersonRegistry};
use crate::schema::{ColumnMap, StructureError, StructureValidator};
use crate::summary::{UploadStats, UploadSummary};
use crate::validator::{CsvRow, RowValidator, ValidatedPersonRecord};

/// Upload size cap enforced at the boundary.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// CSV-compatible MIME types accepted at the boundary.
const CSV_CONTENT_TYPES: [&str; 3] = ["text/csv", "application/csv", "text/plain"];

/// Boundary check: the content type must be CSV-compatible or the filename
/// must end in .csv.
pub fn is_csv_upload(filename: &str, content_type: Option<&str>) -> bool {
    let type_matches = content_type
        .map(|ct| {
            let essence = ct.split(';').next().unwrap_or("").trim();
            CSV_CONTENT_TYPES.contains(&essence)
        })
        .unwrap_or(false);

    type_matches || filename.to_lowercase().ends_with(".csv")
}

// ============================================================================
// UPLOAD ERRORS
// ============================================================================

/// Hard failures surfaced to the caller. Everything row-level stays inside
/// the stats instead.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Estructura de CSV inválida: {0}")]
    Structure(#[from] StructureError),

    #[error("Error procesando archivo CSV: {0}")]
    Infrastructure(#[from] anyhow::Error),
}

// ============================================================================
// BATCH REPORT
// ============================================================================

/// Final outcome handed back to the upload boundary.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub upload_id: i64,
    pub stats: UploadSummary,
}

// ============================================================================
// INGESTION PIPELINE
// ============================================================================

/// Drives a whole submission: ledger open, structure gate, row loop inside
/// one transaction, ledger finalize, audit record.
pub struct IngestionPipeline<'a> {
    structure: StructureValidator,
    validator: RowValidator,
    resolver: PersonResolver,
    ledger: UploadLedger,
    registry: &'a dyn PersonRegistry,
    audit: &'a dyn AuditSink,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(registry: &'a dyn PersonRegistry, audit: &'a dyn AuditSink) -> Self {
        IngestionPipeline {
            structure: StructureValidator::new(),
            validator: RowValidator::new(),
            resolver: PersonResolver::new(),
            ledger: UploadLedger::new(),
            registry,
            audit,
        }
    }

    /// Pipeline wired to the SQLite-backed registry and audit sink.
    pub fn sqlite() -> IngestionPipeline<'static> {
        IngestionPipeline::new(&SqlitePersonRegistry, &SqliteAuditSink)
    }

    /// Process one uploaded file against the given refugio.
    ///
    /// The whole row loop shares one transaction: per-row soft failures keep
    /// the batch alive, but an infrastructure error rolls everything back and
    /// no partial state is visible afterwards. The ledger row lives outside
    /// that transaction so the submission stays recorded either way.
    pub fn run(
        &self,
        conn: &mut Connection,
        data: &[u8],
        nombre_original: &str,
        refugio_id: i64,
        usuario_id: i64,
    ) -> Result<BatchReport, UploadError> {
        let upload_id = self
            .ledger
            .open(conn, nombre_original, usuario_id, refugio_id)?;

        // Structure gate: reject the whole upload before any row work
        let columns = match self.structure.validate(data) {
            Ok(columns) => columns,
            Err(err) => {
                let mensaje = err.to_string();
                self.ledger.finalize(
                    conn,
                    upload_id,
                    UploadState::Failed,
                    &UploadStats::new(),
                    Some(&mensaje),
                )?;
                return Err(UploadError::Structure(err));
            }
        };

        self.ledger.mark_validated(conn, upload_id)?;

        let mut stats = UploadStats::new();

        match self.process_rows(conn, data, &columns, refugio_id, usuario_id, &mut stats) {
            Ok(()) => {
                let mensaje = format!(
                    "Processed: {}, Failed: {}",
                    stats.successful, stats.errors
                );
                self.ledger.finalize(
                    conn,
                    upload_id,
                    UploadState::Completed,
                    &stats,
                    Some(&mensaje),
                )?;

                let resumen = format!(
                    "CSV upload completed: {} records processed",
                    stats.processed
                );
                if let Err(err) = self.audit.record(
                    conn,
                    usuario_id,
                    "CSV_UPLOAD",
                    "BulkUploads",
                    Some(upload_id),
                    &resumen,
                ) {
                    warn!(upload_id, error = %err, "audit record failed");
                }

                info!(
                    upload_id,
                    processed = stats.processed,
                    successful = stats.successful,
                    errors = stats.errors,
                    "upload completed"
                );

                Ok(BatchReport {
                    upload_id,
                    stats: UploadSummary::build(&stats),
                })
            }
            Err(err) => {
                // {:#} keeps the whole error chain in the ledger message
                let mensaje = format!("{err:#}");
                self.ledger.finalize(
                    conn,
                    upload_id,
                    UploadState::Failed,
                    &stats,
                    Some(&mensaje),
                )?;
                Err(UploadError::Infrastructure(err))
            }
        }
    }

    /// The row loop. Returns Err only for infrastructure failures; the open
    /// transaction rolls back on that path when it is dropped uncommitted.
    fn process_rows(
        &self,
        conn: &mut Connection,
        data: &[u8],
        columns: &ColumnMap,
        refugio_id: i64,
        usuario_id: i64,
        stats: &mut UploadStats,
    ) -> Result<()> {
        let tx = conn
            .transaction()
            .context("Failed to open batch transaction")?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(data);

        // Header is row 1, so the first data row is row 2
        for (index, result) in reader.records().enumerate() {
            let row_number = index + 2;

            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    warn!(row_number, error = %err, "unreadable row");
                    stats.record_failure(row_number, "Malformed CSV row");
                    continue;
                }
            };

            let row = CsvRow {
                row_number,
                record: &record,
            };

            let validated = match self.validator.validate(&row, columns) {
                Ok(validated) => validated,
                Err(err) => {
                    stats.record_failure(row_number, err);
                    continue;
                }
            };

            match self.ingest_row(&tx, &validated, refugio_id, usuario_id) {
                Ok(_) => stats.record_success(),
                Err(err) if err.is_fatal() => {
                    return Err(anyhow::Error::new(err).context("Batch aborted"));
                }
                Err(err) => {
                    warn!(row_number, error = %err, "row persistence failed");
                    stats.record_failure(row_number, err);
                }
            }
        }

        tx.commit().context("Failed to commit batch")?;
        Ok(())
    }

    fn ingest_row(
        &self,
        conn: &Connection,
        record: &ValidatedPersonRecord,
        refugio_id: i64,
        usuario_id: i64,
    ) -> std::result::Result<Resolution, RegistryError> {
        let resolution = self.resolver.resolve(conn, self.registry, record)?;
        self.registry.register_entry(
            conn,
            resolution.persona_id,
            refugio_id,
            &record.entry,
            usuario_id,
        )?;
        Ok(resolution)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_ingresos, count_personas, get_audit_for_object, setup_database};
    use crate::ledger::get_upload;
    use crate::resolver::RegistryError;
    use std::cell::Cell;

    const HEADER: &str =
        "nombre_preferido,edad_rango,genero,idioma_principal,localidad,situacion,area_asignada,estatus";

    fn test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        crate::db::insert_refugio(&conn, "Refugio Central", 120).unwrap();
        conn
    }

    fn run_upload(conn: &mut Connection, csv: &str) -> Result<BatchReport, UploadError> {
        IngestionPipeline::sqlite().run(conn, csv.as_bytes(), "personas.csv", 1, 1)
    }

    fn valid_row(nombre: &str) -> String {
        format!("{nombre},Adulto,F,Español,Ciudad X,Vivienda perdida,Area-1,Alojado")
    }

    #[test]
    fn test_single_valid_row_creates_persona_and_entry() {
        let mut conn = test_connection();
        let csv = format!("{HEADER}\nAna,Adulto,F,Español,Ciudad X,Vivienda perdida,Area-1,Alojado\n");

        let report = run_upload(&mut conn, &csv).unwrap();

        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.stats.successful, 1);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(count_personas(&conn).unwrap(), 1);
        assert_eq!(count_ingresos(&conn).unwrap(), 1);

        let batch = get_upload(&conn, report.upload_id).unwrap().unwrap();
        assert_eq!(batch.estado, UploadState::Completed);
        assert_eq!(batch.filas_exitosas, 1);
    }

    #[test]
    fn test_all_valid_rows_all_succeed() {
        let mut conn = test_connection();
        let mut csv = format!("{HEADER}\n");
        for i in 0..8 {
            csv.push_str(&valid_row(&format!("Persona {i}")));
            csv.push('\n');
        }

        let report = run_upload(&mut conn, &csv).unwrap();

        assert_eq!(report.stats.processed, 8);
        assert_eq!(report.stats.successful, 8);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(count_personas(&conn).unwrap(), 8);
    }

    #[test]
    fn test_invalid_genero_is_soft_and_isolated() {
        let mut conn = test_connection();
        let csv = format!(
            "{HEADER}\nAna,Adulto,Invalido,Español,Ciudad X,Vivienda perdida,Area-1,Alojado\n{}\n",
            valid_row("Luis")
        );

        let report = run_upload(&mut conn, &csv).unwrap();

        assert_eq!(report.stats.processed, 2);
        assert_eq!(report.stats.successful, 1);
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.error_details, vec!["Row 2: Invalid genero"]);

        // The bad row created nothing; the good row went through
        assert_eq!(count_personas(&conn).unwrap(), 1);
        let nombre: String = conn
            .query_row("SELECT nombre_preferido FROM Personas", [], |row| row.get(0))
            .unwrap();
        assert_eq!(nombre, "Luis");
    }

    #[test]
    fn test_missing_header_column_rejects_before_any_row() {
        let mut conn = test_connection();
        let csv = "nombre_preferido,genero,localidad,situacion,area_asignada\nAna,F,Ciudad X,Vivienda perdida,Area-1\n";

        let err = run_upload(&mut conn, csv).unwrap_err();

        assert!(matches!(
            err,
            UploadError::Structure(StructureError::MissingColumns(_))
        ));
        assert_eq!(count_personas(&conn).unwrap(), 0);

        let batch = get_upload(&conn, 1).unwrap().unwrap();
        assert_eq!(batch.estado, UploadState::Failed);
        assert_eq!(batch.filas_procesadas, 0);
    }

    #[test]
    fn test_empty_file_rejected() {
        let mut conn = test_connection();

        let err = run_upload(&mut conn, "").unwrap_err();

        assert!(matches!(
            err,
            UploadError::Structure(StructureError::EmptyFile)
        ));
    }

    #[test]
    fn test_header_only_file_completes_with_zero_rows() {
        let mut conn = test_connection();

        let report = run_upload(&mut conn, &format!("{HEADER}\n")).unwrap();

        assert_eq!(report.stats.processed, 0);
        let batch = get_upload(&conn, report.upload_id).unwrap().unwrap();
        assert_eq!(batch.estado, UploadState::Completed);
    }

    #[test]
    fn test_reupload_takes_update_path() {
        let mut conn = test_connection();
        let mut csv = format!("{HEADER}\n");
        for i in 0..4 {
            csv.push_str(&valid_row(&format!("Persona {i}")));
            csv.push('\n');
        }

        let first = run_upload(&mut conn, &csv).unwrap();
        assert_eq!(first.stats.successful, 4);
        assert_eq!(count_personas(&conn).unwrap(), 4);

        let second = run_upload(&mut conn, &csv).unwrap();
        assert_eq!(second.stats.successful, 4);
        assert_eq!(second.stats.errors, 0);

        // Same identities resolve to the same personas; open entries are kept
        assert_eq!(count_personas(&conn).unwrap(), 4);
        assert_eq!(count_ingresos(&conn).unwrap(), 4);
    }

    #[test]
    fn test_column_count_mismatch_is_soft() {
        let mut conn = test_connection();
        let csv = format!("{HEADER}\nAna,Adulto,F\n{}\n", valid_row("Luis"));

        let report = run_upload(&mut conn, &csv).unwrap();

        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.error_details, vec!["Row 2: Column count mismatch"]);
        assert_eq!(report.stats.successful, 1);
    }

    #[test]
    fn test_audit_record_written_on_completion() {
        let mut conn = test_connection();
        let csv = format!("{HEADER}\n{}\n", valid_row("Ana"));

        let report = run_upload(&mut conn, &csv).unwrap();

        let records = get_audit_for_object(&conn, "BulkUploads", report.upload_id).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].accion, "CSV_UPLOAD");
        assert_eq!(
            records[0].resumen.as_deref(),
            Some("CSV upload completed: 1 records processed")
        );
    }

    // ------------------------------------------------------------------------
    // Whole-batch rollback on infrastructure failure
    // ------------------------------------------------------------------------

    /// Delegates to the real registry until the fuse burns out, then fails
    /// like a lost connection would.
    struct BlowingFuseRegistry {
        inner: SqlitePersonRegistry,
        creates_left: Cell<usize>,
    }

    impl BlowingFuseRegistry {
        fn new(creates_left: usize) -> Self {
            BlowingFuseRegistry {
                inner: SqlitePersonRegistry::new(),
                creates_left: Cell::new(creates_left),
            }
        }
    }

    impl PersonRegistry for BlowingFuseRegistry {
        fn find_by_fingerprint(
            &self,
            conn: &Connection,
            fingerprint: &str,
        ) -> std::result::Result<Option<i64>, RegistryError> {
            self.inner.find_by_fingerprint(conn, fingerprint)
        }

        fn create_person(
            &self,
            conn: &Connection,
            record: &ValidatedPersonRecord,
            fingerprint: &str,
        ) -> std::result::Result<i64, RegistryError> {
            if self.creates_left.get() == 0 {
                return Err(RegistryError::Fatal("database connection lost".to_string()));
            }
            self.creates_left.set(self.creates_left.get() - 1);
            self.inner.create_person(conn, record, fingerprint)
        }

        fn update_person(
            &self,
            conn: &Connection,
            persona_id: i64,
            record: &ValidatedPersonRecord,
        ) -> std::result::Result<(), RegistryError> {
            self.inner.update_person(conn, persona_id, record)
        }

        fn register_entry(
            &self,
            conn: &Connection,
            persona_id: i64,
            refugio_id: i64,
            entry: &crate::validator::EntryFields,
            usuario_id: i64,
        ) -> std::result::Result<i64, RegistryError> {
            self.inner
                .register_entry(conn, persona_id, refugio_id, entry, usuario_id)
        }
    }

    #[test]
    fn test_infrastructure_fault_rolls_back_whole_batch() {
        let mut conn = test_connection();
        let registry = BlowingFuseRegistry::new(5);
        let pipeline = IngestionPipeline::new(&registry, &SqliteAuditSink);

        let mut csv = format!("{HEADER}\n");
        for i in 0..10 {
            csv.push_str(&valid_row(&format!("Persona {i}")));
            csv.push('\n');
        }

        let err = pipeline
            .run(&mut conn, csv.as_bytes(), "personas.csv", 1, 1)
            .unwrap_err();
        assert!(matches!(err, UploadError::Infrastructure(_)));

        // Five rows succeeded in-memory before the fault; none survive it
        assert_eq!(count_personas(&conn).unwrap(), 0);
        assert_eq!(count_ingresos(&conn).unwrap(), 0);

        // The ledger row survives the rollback and records the failure
        let batch = get_upload(&conn, 1).unwrap().unwrap();
        assert_eq!(batch.estado, UploadState::Failed);
        assert!(batch.mensaje.unwrap().contains("database connection lost"));
    }

    // ------------------------------------------------------------------------
    // Boundary helpers
    // ------------------------------------------------------------------------

    #[test]
    fn test_is_csv_upload() {
        assert!(is_csv_upload("personas.csv", None));
        assert!(is_csv_upload("PERSONAS.CSV", None));
        assert!(is_csv_upload("datos.bin", Some("text/csv")));
        assert!(is_csv_upload("datos.bin", Some("text/csv; charset=utf-8")));
        assert!(is_csv_upload("datos.bin", Some("text/plain")));
        assert!(!is_csv_upload("datos.xlsx", Some("application/vnd.ms-excel")));
        assert!(!is_csv_upload("datos.bin", None));
    }
}
