use snafu::Snafu;
use std::io;
use std::path::PathBuf;

// We want router/handler and component errors together so it's easy to define response error
// codes for all the high-level types of errors that could happen during a request.  Several
// operator-facing messages are kept verbatim from the agent's long-serving predecessor so that
// existing controllers matching on them keep working.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    // Name and input validation errors
    #[snafu(display("Ungueltiger Name: {}", name))]
    BadEntryName { name: String },

    #[snafu(display("Pfad nicht erlaubt"))]
    TraversalName { name: String },

    #[snafu(display("Ungueltiger Backup-Name: {}", filename))]
    BadBackupName { filename: String },

    #[snafu(display("Ungueltiges JSON: {}", source))]
    RegistryParse { source: serde_json::Error },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Lookup errors
    #[snafu(display("Unbekannter Eintrag: {}", name))]
    UnknownEntry { name: String },

    #[snafu(display("Datei fehlt: {}", path.display()))]
    MissingFile { path: PathBuf },

    #[snafu(display("Backup fehlt: {}", filename))]
    MissingBackup { filename: String },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Path guard errors
    #[snafu(display("Pfad nicht erlaubt"))]
    PathDenied { path: PathBuf },

    #[snafu(display("Pfad nicht erlaubt"))]
    SymlinkTarget { path: PathBuf },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Filesystem errors
    #[snafu(display("Schreibfehler: {}", source))]
    WriteFailed { path: PathBuf, source: io::Error },

    #[snafu(display("Lesefehler '{}': {}", path.display(), source))]
    ReadFailed { path: PathBuf, source: io::Error },

    #[snafu(display("Backup-Verzeichnis fehlt: {}", path.display()))]
    BackupDirMissing { path: PathBuf },

    #[snafu(display("Backup-Verzeichnis nicht anlegbar '{}': {}", path.display(), source))]
    BackupDirCreate { path: PathBuf, source: io::Error },

    #[snafu(display("Backup fehlgeschlagen '{}': {}", path.display(), source))]
    BackupFailed { path: PathBuf, source: io::Error },

    #[snafu(display("Restore fehlgeschlagen '{}': {}", path.display(), source))]
    RestoreFailed { path: PathBuf, source: io::Error },

    #[snafu(display("Stat fehlgeschlagen '{}': {}", path.display(), source))]
    StatFailed { path: PathBuf, source: io::Error },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Action errors
    #[snafu(display("Aktion nicht erlaubt: {}", cmd))]
    ActionUnknown { cmd: String },

    #[snafu(display("Aktion nicht erlaubt: {}", cmd))]
    ActionForbidden { cmd: String },

    #[snafu(display("Ungueltiges Argument: {}", arg))]
    BadActionArg { arg: String },

    #[snafu(display("service {} not active", unit))]
    ServiceNotActive { unit: String },

    #[snafu(display("Unable to run '{}': {}", command, source))]
    SpawnFailed { command: String, source: io::Error },

    // =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

    // Server errors
    #[snafu(display("Another thread poisoned the registry lock by panicking"))]
    RegistryLock,

    #[snafu(display("Unable to serialize response: {}", source))]
    ResponseSerialization { source: serde_json::Error },

    #[snafu(display("Unable to bind to {}: {}", addr, source))]
    BindAddress { addr: String, source: io::Error },

    #[snafu(display("Unable to start server: {}", source))]
    ServerStart { source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
