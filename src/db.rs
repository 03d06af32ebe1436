use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// Open the registry database and make sure the schema exists.
pub fn open_database(path: &std::path::Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Personas - one row per displaced person, keyed by identity fingerprint
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS Personas (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            huella_identidad TEXT UNIQUE NOT NULL,
            nombre_preferido TEXT NOT NULL,
            edad_rango TEXT NOT NULL,
            genero TEXT NOT NULL,
            idioma_principal TEXT,
            grupo_jefe INTEGER NOT NULL DEFAULT 0,
            grupo_id_externo TEXT,
            relacion_con_jefe TEXT,
            creado_en DATETIME DEFAULT CURRENT_TIMESTAMP,
            actualizado_en TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Salud - optional health details, one row per persona
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS Salud (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            persona_id INTEGER NOT NULL,
            condicion_medica TEXT,
            medicamentos TEXT,
            alergias TEXT,
            asistencia_especial TEXT,
            requiere_atencion_urgente INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // ==========================================================================
    // Procedencia - where the persona came from and why
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS Procedencia (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            persona_id INTEGER NOT NULL,
            localidad TEXT NOT NULL,
            municipio TEXT,
            departamento TEXT,
            situacion TEXT NOT NULL,
            tiene_mascotas INTEGER NOT NULL DEFAULT 0,
            mascotas_detalle TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Refugios
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS Refugios (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            nombre TEXT NOT NULL,
            capacidad_maxima INTEGER NOT NULL DEFAULT 0,
            creado_en DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Ingresos - a persona's stay at a refugio; fecha_salida NULL = still open
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS Ingresos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            persona_id INTEGER NOT NULL,
            refugio_id INTEGER NOT NULL,
            fecha_ingreso TEXT NOT NULL,
            hora_ingreso TEXT NOT NULL,
            area_asignada TEXT NOT NULL,
            estatus TEXT NOT NULL,
            observaciones TEXT,
            fecha_salida TEXT,
            registrado_por INTEGER NOT NULL,
            creado_en DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // BulkUploads - one row per CSV submission, never deleted
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS BulkUploads (
            upload_id INTEGER PRIMARY KEY AUTOINCREMENT,
            archivo_nombre TEXT NOT NULL,
            nombre_original TEXT NOT NULL,
            usuario_id INTEGER NOT NULL,
            refugio_id INTEGER NOT NULL,
            estado TEXT NOT NULL,
            total_filas INTEGER NOT NULL DEFAULT 0,
            filas_procesadas INTEGER NOT NULL DEFAULT 0,
            filas_exitosas INTEGER NOT NULL DEFAULT 0,
            filas_fallidas INTEGER NOT NULL DEFAULT 0,
            mensaje TEXT,
            detalles TEXT,
            creado_en DATETIME DEFAULT CURRENT_TIMESTAMP,
            procesado_en TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // AuditLog
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS AuditLog (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            usuario_id INTEGER NOT NULL,
            accion TEXT NOT NULL,
            objeto TEXT NOT NULL,
            objeto_id INTEGER,
            resumen TEXT,
            creado_en DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_personas_huella ON Personas(huella_identidad)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ingresos_persona ON Ingresos(persona_id, refugio_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ingresos_refugio ON Ingresos(refugio_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_uploads_refugio ON BulkUploads(refugio_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_objeto ON AuditLog(objeto, objeto_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Sink for audit-trail records. Writes must never take down the operation
/// being audited; callers log and continue on failure.
pub trait AuditSink {
    fn record(
        &self,
        conn: &Connection,
        usuario_id: i64,
        accion: &str,
        objeto: &str,
        objeto_id: Option<i64>,
        resumen: &str,
    ) -> Result<()>;
}

pub struct SqliteAuditSink;

impl AuditSink for SqliteAuditSink {
    fn record(
        &self,
        conn: &Connection,
        usuario_id: i64,
        accion: &str,
        objeto: &str,
        objeto_id: Option<i64>,
        resumen: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO AuditLog (usuario_id, accion, objeto, objeto_id, resumen)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![usuario_id, accion, objeto, objeto_id, resumen],
        )?;

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub usuario_id: i64,
    pub accion: String,
    pub objeto: String,
    pub objeto_id: Option<i64>,
    pub resumen: Option<String>,
    pub creado_en: String,
}

/// Audit records for a specific object, newest first.
pub fn get_audit_for_object(
    conn: &Connection,
    objeto: &str,
    objeto_id: i64,
) -> Result<Vec<AuditRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, usuario_id, accion, objeto, objeto_id, resumen, creado_en
         FROM AuditLog
         WHERE objeto = ?1 AND objeto_id = ?2
         ORDER BY id DESC",
    )?;

    let records = stmt
        .query_map(params![objeto, objeto_id], |row| {
            Ok(AuditRecord {
                id: row.get(0)?,
                usuario_id: row.get(1)?,
                accion: row.get(2)?,
                objeto: row.get(3)?,
                objeto_id: row.get(4)?,
                resumen: row.get(5)?,
                creado_en: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

// ============================================================================
// REFUGIOS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refugio {
    pub id: i64,
    pub nombre: String,
    pub capacidad_maxima: i64,
}

pub fn insert_refugio(conn: &Connection, nombre: &str, capacidad_maxima: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO Refugios (nombre, capacidad_maxima) VALUES (?1, ?2)",
        params![nombre, capacidad_maxima],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn get_refugios(conn: &Connection) -> Result<Vec<Refugio>> {
    let mut stmt =
        conn.prepare("SELECT id, nombre, capacidad_maxima FROM Refugios ORDER BY nombre")?;

    let refugios = stmt
        .query_map([], |row| {
            Ok(Refugio {
                id: row.get(0)?,
                nombre: row.get(1)?,
                capacidad_maxima: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(refugios)
}

/// Anonymized occupancy per refugio: open entries with estatus Alojado.
#[derive(Debug, Clone, Serialize)]
pub struct RefugioStat {
    pub refugio_id: i64,
    pub nombre: String,
    pub capacidad_maxima: i64,
    pub alojados: i64,
}

pub fn get_refugio_stats(conn: &Connection) -> Result<Vec<RefugioStat>> {
    let mut stmt = conn.prepare(
        "SELECT
            r.id,
            r.nombre,
            r.capacidad_maxima,
            COUNT(i.id) as alojados
         FROM Refugios r
         LEFT JOIN Ingresos i
           ON i.refugio_id = r.id
          AND i.fecha_salida IS NULL
          AND i.estatus = 'Alojado'
         GROUP BY r.id, r.nombre, r.capacidad_maxima
         ORDER BY r.nombre",
    )?;

    let stats = stmt
        .query_map([], |row| {
            Ok(RefugioStat {
                refugio_id: row.get(0)?,
                nombre: row.get(1)?,
                capacidad_maxima: row.get(2)?,
                alojados: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(stats)
}

// ============================================================================
// COUNTS
// ============================================================================

pub fn count_personas(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM Personas", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_ingresos(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM Ingresos", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_connection();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();
    }

    #[test]
    fn test_open_database_persists_schema_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("refugios.db");

        {
            let conn = open_database(&path).unwrap();
            insert_refugio(&conn, "Refugio Norte", 50).unwrap();
        }

        let conn = open_database(&path).unwrap();
        let refugios = get_refugios(&conn).unwrap();
        assert_eq!(refugios.len(), 1);
        assert_eq!(refugios[0].nombre, "Refugio Norte");
    }

    #[test]
    fn test_audit_record_round_trip() {
        let conn = test_connection();

        SqliteAuditSink
            .record(&conn, 7, "CSV_UPLOAD", "BulkUploads", Some(3), "test upload")
            .unwrap();

        let records = get_audit_for_object(&conn, "BulkUploads", 3).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].usuario_id, 7);
        assert_eq!(records[0].accion, "CSV_UPLOAD");
        assert_eq!(records[0].resumen.as_deref(), Some("test upload"));
    }

    #[test]
    fn test_refugio_stats_count_only_open_housed_entries() {
        let conn = test_connection();
        let refugio_id = insert_refugio(&conn, "Refugio Central", 120).unwrap();

        conn.execute(
            "INSERT INTO Ingresos (persona_id, refugio_id, fecha_ingreso, hora_ingreso,
                                   area_asignada, estatus, registrado_por)
             VALUES (1, ?1, '2025-11-01', '08:00:00', 'Area-1', 'Alojado', 1)",
            params![refugio_id],
        )
        .unwrap();

        // Discharged entry must not count
        conn.execute(
            "INSERT INTO Ingresos (persona_id, refugio_id, fecha_ingreso, hora_ingreso,
                                   area_asignada, estatus, fecha_salida, registrado_por)
             VALUES (2, ?1, '2025-11-01', '09:00:00', 'Area-1', 'Dado de alta', '2025-11-02', 1)",
            params![refugio_id],
        )
        .unwrap();

        let stats = get_refugio_stats(&conn).unwrap();

        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].nombre, "Refugio Central");
        assert_eq!(stats[0].alojados, 1);
    }
}
