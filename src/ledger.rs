// 📋 Upload Ledger - BulkUploads lifecycle
// Every submission gets a row before any row work starts; rows are never
// deleted, so a rolled-back batch still leaves its audit trace.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::summary::UploadStats;

// ============================================================================
// UPLOAD STATE
// ============================================================================

/// Batch lifecycle. Transitions only move forward:
/// Processing → {Validated | Failed}, Validated → {Completed | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadState {
    Processing,
    Validated,
    Failed,
    Completed,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Processing => "Procesando",
            UploadState::Validated => "Validado",
            UploadState::Failed => "Fallido",
            UploadState::Completed => "Completado",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Procesando" => Some(UploadState::Processing),
            "Validado" => Some(UploadState::Validated),
            "Fallido" => Some(UploadState::Failed),
            "Completado" => Some(UploadState::Completed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: UploadState) -> bool {
        matches!(
            (self, next),
            (UploadState::Processing, UploadState::Validated)
                | (UploadState::Processing, UploadState::Failed)
                | (UploadState::Validated, UploadState::Completed)
                | (UploadState::Validated, UploadState::Failed)
        )
    }
}

// ============================================================================
// UPLOAD BATCH
// ============================================================================

/// Read model for one BulkUploads row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadBatch {
    pub upload_id: i64,
    pub archivo_nombre: String,
    pub nombre_original: String,
    pub usuario_id: i64,
    pub refugio_id: i64,
    pub estado: UploadState,
    pub total_filas: i64,
    pub filas_procesadas: i64,
    pub filas_exitosas: i64,
    pub filas_fallidas: i64,
    pub mensaje: Option<String>,
    /// Full per-row error details, stored as a JSON array.
    pub detalles: Vec<String>,
    pub creado_en: String,
    pub procesado_en: Option<String>,
}

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadBatch> {
    let estado_str: String = row.get(5)?;
    let estado = UploadState::parse(&estado_str).ok_or(rusqlite::Error::InvalidQuery)?;

    let detalles_json: Option<String> = row.get(11)?;
    let detalles = detalles_json
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();

    Ok(UploadBatch {
        upload_id: row.get(0)?,
        archivo_nombre: row.get(1)?,
        nombre_original: row.get(2)?,
        usuario_id: row.get(3)?,
        refugio_id: row.get(4)?,
        estado,
        total_filas: row.get(6)?,
        filas_procesadas: row.get(7)?,
        filas_exitosas: row.get(8)?,
        filas_fallidas: row.get(9)?,
        mensaje: row.get(10)?,
        detalles,
        creado_en: row.get(12)?,
        procesado_en: row.get(13)?,
    })
}

const BATCH_COLUMNS: &str = "upload_id, archivo_nombre, nombre_original, usuario_id, refugio_id,
     estado, total_filas, filas_procesadas, filas_exitosas, filas_fallidas,
     mensaje, detalles, creado_en, procesado_en";

// ============================================================================
// UPLOAD LEDGER
// ============================================================================

pub struct UploadLedger;

impl UploadLedger {
    pub fn new() -> Self {
        UploadLedger
    }

    /// Open the ledger row for a new submission. The stored filename is
    /// generated so user-supplied names never collide on disk.
    pub fn open(
        &self,
        conn: &Connection,
        nombre_original: &str,
        usuario_id: i64,
        refugio_id: i64,
    ) -> Result<i64> {
        let archivo_nombre = format!("csv_{}.csv", uuid::Uuid::new_v4());

        conn.execute(
            "INSERT INTO BulkUploads (archivo_nombre, nombre_original, usuario_id, refugio_id, estado)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                archivo_nombre,
                nombre_original,
                usuario_id,
                refugio_id,
                UploadState::Processing.as_str(),
            ],
        )
        .context("Failed to create upload record")?;

        Ok(conn.last_insert_rowid())
    }

    /// Mark the batch structurally valid; row processing starts after this.
    pub fn mark_validated(&self, conn: &Connection, upload_id: i64) -> Result<()> {
        self.transition(conn, upload_id, UploadState::Validated)?;

        conn.execute(
            "UPDATE BulkUploads SET estado = ?1 WHERE upload_id = ?2",
            params![UploadState::Validated.as_str(), upload_id],
        )?;

        Ok(())
    }

    /// Close the batch with its final state and counts. Called exactly once
    /// per batch; terminal states reject further transitions.
    pub fn finalize(
        &self,
        conn: &Connection,
        upload_id: i64,
        state: UploadState,
        stats: &UploadStats,
        mensaje: Option<&str>,
    ) -> Result<()> {
        self.transition(conn, upload_id, state)?;

        let detalles = serde_json::to_string(&stats.error_details)?;

        conn.execute(
            "UPDATE BulkUploads
             SET estado = ?1, total_filas = ?2, filas_procesadas = ?2,
                 filas_exitosas = ?3, filas_fallidas = ?4, mensaje = ?5,
                 detalles = ?6, procesado_en = ?7
             WHERE upload_id = ?8",
            params![
                state.as_str(),
                stats.processed as i64,
                stats.successful as i64,
                stats.errors as i64,
                mensaje,
                detalles,
                Utc::now().to_rfc3339(),
                upload_id,
            ],
        )?;

        Ok(())
    }

    fn transition(&self, conn: &Connection, upload_id: i64, next: UploadState) -> Result<()> {
        let estado: Option<String> = conn
            .query_row(
                "SELECT estado FROM BulkUploads WHERE upload_id = ?1",
                params![upload_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(estado) = estado else {
            bail!("Upload {} not found", upload_id);
        };

        let current = UploadState::parse(&estado)
            .with_context(|| format!("Upload {} has unknown state: {}", upload_id, estado))?;

        if !current.can_transition_to(next) {
            bail!(
                "Invalid upload state transition: {} → {}",
                current.as_str(),
                next.as_str()
            );
        }

        Ok(())
    }
}

impl Default for UploadLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn get_upload(conn: &Connection, upload_id: i64) -> Result<Option<UploadBatch>> {
    let batch = conn
        .query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM BulkUploads WHERE upload_id = ?1"),
            params![upload_id],
            batch_from_row,
        )
        .optional()?;

    Ok(batch)
}

/// Upload history, newest first, optionally filtered by refugio.
pub fn get_upload_history(
    conn: &Connection,
    refugio_id: Option<i64>,
    limit: i64,
) -> Result<Vec<UploadBatch>> {
    let uploads = match refugio_id {
        Some(refugio_id) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BATCH_COLUMNS} FROM BulkUploads
                 WHERE refugio_id = ?1
                 ORDER BY upload_id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![refugio_id, limit], batch_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BATCH_COLUMNS} FROM BulkUploads
                 ORDER BY upload_id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], batch_from_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(uploads)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn test_stats() -> UploadStats {
        let mut stats = UploadStats::new();
        stats.record_success();
        stats.record_success();
        stats.record_failure(4, "Invalid genero");
        stats
    }

    #[test]
    fn test_open_starts_processing() {
        let conn = test_connection();
        let ledger = UploadLedger::new();

        let upload_id = ledger.open(&conn, "personas.csv", 1, 2).unwrap();
        let batch = get_upload(&conn, upload_id).unwrap().unwrap();

        assert_eq!(batch.estado, UploadState::Processing);
        assert_eq!(batch.nombre_original, "personas.csv");
        assert!(batch.archivo_nombre.starts_with("csv_"));
        assert_eq!(batch.procesado_en, None);
    }

    #[test]
    fn test_full_lifecycle() {
        let conn = test_connection();
        let ledger = UploadLedger::new();

        let upload_id = ledger.open(&conn, "personas.csv", 1, 2).unwrap();
        ledger.mark_validated(&conn, upload_id).unwrap();
        ledger
            .finalize(
                &conn,
                upload_id,
                UploadState::Completed,
                &test_stats(),
                Some("Processed: 2, Failed: 1"),
            )
            .unwrap();

        let batch = get_upload(&conn, upload_id).unwrap().unwrap();
        assert_eq!(batch.estado, UploadState::Completed);
        assert_eq!(batch.filas_procesadas, 3);
        assert_eq!(batch.filas_exitosas, 2);
        assert_eq!(batch.filas_fallidas, 1);
        assert_eq!(batch.detalles, vec!["Row 4: Invalid genero"]);
        assert!(batch.procesado_en.is_some());
    }

    #[test]
    fn test_states_never_move_backward() {
        assert!(UploadState::Processing.can_transition_to(UploadState::Validated));
        assert!(UploadState::Processing.can_transition_to(UploadState::Failed));
        assert!(UploadState::Validated.can_transition_to(UploadState::Completed));
        assert!(UploadState::Validated.can_transition_to(UploadState::Failed));

        assert!(!UploadState::Validated.can_transition_to(UploadState::Processing));
        assert!(!UploadState::Completed.can_transition_to(UploadState::Failed));
        assert!(!UploadState::Failed.can_transition_to(UploadState::Completed));
        // Completion requires passing the structure gate first
        assert!(!UploadState::Processing.can_transition_to(UploadState::Completed));
    }

    #[test]
    fn test_finalize_is_terminal() {
        let conn = test_connection();
        let ledger = UploadLedger::new();

        let upload_id = ledger.open(&conn, "personas.csv", 1, 2).unwrap();
        ledger
            .finalize(&conn, upload_id, UploadState::Failed, &UploadStats::new(), None)
            .unwrap();

        let again = ledger.finalize(
            &conn,
            upload_id,
            UploadState::Completed,
            &UploadStats::new(),
            None,
        );
        assert!(again.is_err());
    }

    #[test]
    fn test_history_filters_by_refugio() {
        let conn = test_connection();
        let ledger = UploadLedger::new();

        ledger.open(&conn, "a.csv", 1, 1).unwrap();
        ledger.open(&conn, "b.csv", 1, 2).unwrap();
        ledger.open(&conn, "c.csv", 1, 2).unwrap();

        let all = get_upload_history(&conn, None, 50).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].nombre_original, "c.csv");

        let filtered = get_upload_history(&conn, Some(2), 50).unwrap();
        assert_eq!(filtered.len(), 2);
    }
}
