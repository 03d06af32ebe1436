// 📐 CSV Schema - Header canon + structure gate
// Validates the uploaded header before any row is processed

use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// COLUMN CANON
// ============================================================================

/// Canonical column order for bulk-upload files.
///
/// A header may omit optional columns, but the columns it does carry must
/// follow this relative order. Matching is case-insensitive.
pub const CANONICAL_COLUMNS: [&str; 19] = [
    "nombre_preferido",
    "edad_rango",
    "genero",
    "idioma_principal",
    "grupo_jefe",
    "grupo_id_externo",
    "relacion_con_jefe",
    "condicion_medica",
    "medicamentos",
    "alergias",
    "asistencia_especial",
    "localidad",
    "situacion",
    "tiene_mascotas",
    "mascotas_detalle",
    "fecha_ingreso",
    "hora_ingreso",
    "area_asignada",
    "estatus",
];

/// Columns every upload must carry.
pub const REQUIRED_COLUMNS: [&str; 6] = [
    "nombre_preferido",
    "edad_rango",
    "genero",
    "localidad",
    "situacion",
    "area_asignada",
];

// ============================================================================
// STRUCTURE ERRORS
// ============================================================================

/// Reasons an upload is rejected before any row is processed.
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("Archivo CSV vacío")]
    EmptyFile,

    #[error("Columnas requeridas faltantes: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Columna desconocida: {0}")]
    UnknownColumn(String),

    #[error("Columna duplicada: {0}")]
    DuplicateColumn(String),

    #[error("Orden de columnas inválido (se esperaba: {})", .expected.join(", "))]
    OutOfOrder {
        expected: Vec<String>,
        received: Vec<String>,
    },

    #[error("No se pudo leer el archivo: {0}")]
    Unreadable(#[from] csv::Error),
}

// ============================================================================
// COLUMN MAP
// ============================================================================

/// Lowercased column name → index map for one validated header.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    indices: HashMap<String, usize>,
    count: usize,
}

impl ColumnMap {
    /// Index of a column in the data rows, if the header carried it.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.indices.get(column).copied()
    }

    pub fn has(&self, column: &str) -> bool {
        self.indices.contains_key(column)
    }

    /// Number of columns in the validated header.
    pub fn column_count(&self) -> usize {
        self.count
    }
}

// ============================================================================
// STRUCTURE VALIDATOR
// ============================================================================

/// Header gate for uploaded CSV files.
///
/// Read-only scan of the header line; callers re-read the data rows from the
/// start of the buffer afterwards.
pub struct StructureValidator;

impl StructureValidator {
    pub fn new() -> Self {
        StructureValidator
    }

    /// Validate the header and hand back the column map used by row
    /// validation.
    pub fn validate(&self, data: &[u8]) -> Result<ColumnMap, StructureError> {
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(StructureError::EmptyFile);
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(data);

        let headers = reader.headers()?;

        let received: Vec<String> = headers
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();

        if received.is_empty() || received.iter().all(|h| h.is_empty()) {
            return Err(StructureError::EmptyFile);
        }

        // All required columns must be present
        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .filter(|required| !received.iter().any(|h| h == *required))
            .map(|required| required.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(StructureError::MissingColumns(missing));
        }

        // Every column must be a known one, and appear only once
        let mut canon_positions = Vec::with_capacity(received.len());
        let mut indices = HashMap::with_capacity(received.len());

        for (index, name) in received.iter().enumerate() {
            let position = CANONICAL_COLUMNS
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| StructureError::UnknownColumn(name.clone()))?;

            if indices.insert(name.clone(), index).is_some() {
                return Err(StructureError::DuplicateColumn(name.clone()));
            }

            canon_positions.push(position);
        }

        // Columns present must follow the canonical relative order
        if canon_positions.windows(2).any(|w| w[0] >= w[1]) {
            let expected: Vec<String> = CANONICAL_COLUMNS
                .iter()
                .filter(|c| received.iter().any(|h| h == *c))
                .map(|c| c.to_string())
                .collect();

            return Err(StructureError::OutOfOrder { expected, received });
        }

        let count = received.len();
        Ok(ColumnMap { indices, count })
    }
}

impl Default for StructureValidator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
