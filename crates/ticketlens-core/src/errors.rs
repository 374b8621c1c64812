/// Result type alias using ExError
pub type Result<T> = std::result::Result<T, ExError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// This taxonomy provides a stable, structured classification of all errors
/// raised by the persistence core. Each kind maps to a stable error code that
/// can be used for programmatic error handling, testing, and for the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExErrorKind {
    // Structural/Validation
    InvalidInput,

    // Migration
    /// A migration declares a dependency on a version that is not registered
    MissingDependency,
    /// The migration dependency graph contains a cycle
    CycleDetected,
    /// Two registered migrations share a version identifier
    DuplicateMigration,
    /// An `up` or `down` step failed
    MigrationFailed,
    /// Recorded checksum differs from the registered migration (fatal only under a strict policy)
    MigrationDrift,

    // Session
    Initialization,
    NotInitialized,
    Statement,
    Transaction,

    // Integration/IO
    Io,
    Serialization,
    Persistence,

    // Internal
    Internal,
}

impl ExErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ExErrorKind::InvalidInput => "ERR_INVALID_INPUT",
            ExErrorKind::MissingDependency => "ERR_MISSING_DEPENDENCY",
            ExErrorKind::CycleDetected => "ERR_CYCLE_DETECTED",
            ExErrorKind::DuplicateMigration => "ERR_DUPLICATE_MIGRATION",
            ExErrorKind::MigrationFailed => "ERR_MIGRATION_FAILED",
            ExErrorKind::MigrationDrift => "ERR_MIGRATION_DRIFT",
            ExErrorKind::Initialization => "ERR_INITIALIZATION",
            ExErrorKind::NotInitialized => "ERR_NOT_INITIALIZED",
            ExErrorKind::Statement => "ERR_STATEMENT",
            ExErrorKind::Transaction => "ERR_TRANSACTION",
            ExErrorKind::Io => "ERR_IO",
            ExErrorKind::Serialization => "ERR_SERIALIZATION",
            ExErrorKind::Persistence => "ERR_PERSISTENCE",
            ExErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    /// Whether the kind describes a defect in the migration list itself.
    ///
    /// Structural failures are never retried during session initialization.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ExErrorKind::MissingDependency
                | ExErrorKind::CycleDetected
                | ExErrorKind::DuplicateMigration
                | ExErrorKind::MigrationDrift
        )
    }
}

/// Canonical structured error type
///
/// Carries a classification, the operation that failed, an optional entity
/// (migration version, savepoint name, file path) and the wrapped cause.
#[derive(Debug, Clone)]
pub struct ExError {
    kind: ExErrorKind,
    op: Option<String>,
    entity_id: Option<String>,
    message: String,
    source: Option<Box<ExError>>,
}

impl ExError {
    /// Create a new error with the specified kind
    pub fn new(kind: ExErrorKind) -> Self {
        Self {
            kind,
            op: None,
            entity_id: None,
            message: String::new(),
            source: None,
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add entity ID context
    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.entity_id = Some(id.into());
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Add source error
    pub fn with_source(mut self, source: ExError) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> ExErrorKind {
        self.kind
    }

    /// Get the stable error code
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Get the operation context, if any
    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    /// Get the entity ID context, if any
    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the source error, if any
    pub fn source_error(&self) -> Option<&ExError> {
        self.source.as_deref()
    }

    /// Walk the cause chain down to the innermost error
    pub fn root_cause(&self) -> &ExError {
        let mut current = self;
        while let Some(next) = current.source_error() {
            current = next;
        }
        current
    }
}

impl std::fmt::Display for ExError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(entity_id) = &self.entity_id {
            write!(f, " (entity_id: {})", entity_id)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for ExError {
    fn from(err: serde_json::Error) -> Self {
        ExError::new(ExErrorKind::Serialization).with_message(err.to_string())
    }
}

impl From<std::io::Error> for ExError {
    fn from(err: std::io::Error) -> Self {
        ExError::new(ExErrorKind::Io).with_message(err.to_string())
    }
}

// ========== End Error Facility ==========
