//! Typed SQL statements for the administrative database connection.
//!
//! Statements are built from validated identifiers and quoted literals, so
//! no caller ever concatenates SQL text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::core::SecretValue;
use crate::errors::ConfigError;

#[allow(clippy::expect_used)]
fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$").expect("static pattern"))
}

/// A validated, lower-case SQL identifier (database, role, schema, table).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Validates an identifier.
    ///
    /// # Errors
    ///
    /// Returns an error unless the value matches `[a-z_][a-z0-9_]{0,62}`.
    pub fn new(value: impl Into<String>) -> Result<Self, ConfigError> {
        let value = value.into();
        if identifier_pattern().is_match(&value) {
            Ok(Self(value))
        } else {
            Err(ConfigError::invalid(
                "identifier",
                format!("'{value}' is not a valid SQL identifier"),
            ))
        }
    }

    /// Derives an identifier from a cluster-style resource name
    /// (`conn-oeg-demo` becomes `conn_oeg_demo`).
    ///
    /// # Errors
    ///
    /// Returns an error if the derived value is still not a valid identifier.
    pub fn from_resource_name(name: &str) -> Result<Self, ConfigError> {
        Self::new(name.to_ascii_lowercase().replace(['-', '.'], "_"))
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the identifier double-quoted for SQL.
    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quotes a string literal, doubling embedded single quotes.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Where the database server lives and how to reach it administratively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEndpoint {
    /// Namespace of the database workload.
    pub namespace: String,
    /// Service name, used to build in-cluster URLs.
    pub service: String,
    /// Pod used for administrative sessions.
    pub pod: String,
    /// Service port.
    pub port: u16,
}

impl DatabaseEndpoint {
    /// Returns the in-cluster JDBC URL for a database.
    #[must_use]
    pub fn jdbc_url(&self, database: &Identifier) -> String {
        format!(
            "jdbc:postgresql://{}.{}:{}/{}",
            self.service, self.namespace, self.port, database
        )
    }

    /// Returns the fully-qualified in-cluster host name.
    #[must_use]
    pub fn fqdn(&self) -> String {
        format!("{}.{}.svc", self.service, self.namespace)
    }
}

/// An authenticated connection target.
#[derive(Debug, Clone)]
pub struct DatabaseConnection {
    /// The server.
    pub endpoint: DatabaseEndpoint,
    /// The database to connect to.
    pub database: Identifier,
    /// The login user.
    pub user: String,
    /// The login password.
    pub password: SecretValue,
}

impl DatabaseConnection {
    /// Returns the same login against a different database.
    #[must_use]
    pub fn on(&self, database: &Identifier) -> Self {
        Self {
            database: database.clone(),
            ..self.clone()
        }
    }
}

/// A typed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlStatement {
    /// `SELECT 1`.
    Ping,
    /// Create a login role.
    CreateRole {
        /// Role name.
        role: Identifier,
        /// Login password.
        password: SecretValue,
    },
    /// Reset a role's password.
    AlterRolePassword {
        /// Role name.
        role: Identifier,
        /// New password.
        password: SecretValue,
    },
    /// Create a database owned by a role.
    CreateDatabase {
        /// Database name.
        database: Identifier,
        /// Owning role.
        owner: Identifier,
    },
    /// Reassign database ownership.
    AlterDatabaseOwner {
        /// Database name.
        database: Identifier,
        /// New owner.
        owner: Identifier,
    },
    /// Drop a database if it exists.
    DropDatabase {
        /// Database name.
        database: Identifier,
    },
    /// Drop a role if it exists.
    DropRole {
        /// Role name.
        role: Identifier,
    },
    /// Terminate every other session connected to a database.
    TerminateSessions {
        /// Database name.
        database: Identifier,
    },
    /// One row if the role exists.
    RoleExists {
        /// Role name.
        role: Identifier,
    },
    /// One row holding the owner, if the database exists.
    DatabaseOwner {
        /// Database name.
        database: Identifier,
    },
    /// One row if the table exists in the connected database.
    TableExists {
        /// Schema name.
        schema: Identifier,
        /// Table name.
        table: Identifier,
    },
    /// One row if the participant is registered.
    ParticipantExists {
        /// Participant identifier.
        participant_id: String,
    },
    /// Remove a participant registration.
    DeleteParticipant {
        /// Participant identifier.
        participant_id: String,
    },
}

impl SqlStatement {
    /// Renders the statement for execution.
    #[must_use]
    pub fn render(&self) -> String {
        self.render_with(|secret| quote_literal(secret.expose()))
    }

    /// Renders the statement with secrets masked, for logs.
    #[must_use]
    pub fn redacted(&self) -> String {
        self.render_with(|_| "'***'".to_string())
    }

    /// Returns true if the statement changes server state.
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Self::Ping
                | Self::RoleExists { .. }
                | Self::DatabaseOwner { .. }
                | Self::TableExists { .. }
                | Self::ParticipantExists { .. }
        )
    }

    fn render_with(&self, secret: impl Fn(&SecretValue) -> String) -> String {
        match self {
            Self::Ping => "SELECT 1".to_string(),
            Self::CreateRole { role, password } => {
                format!("CREATE ROLE {} LOGIN PASSWORD {}", role.quoted(), secret(password))
            }
            Self::AlterRolePassword { role, password } => {
                format!(
                    "ALTER ROLE {} WITH LOGIN PASSWORD {}",
                    role.quoted(),
                    secret(password)
                )
            }
            Self::CreateDatabase { database, owner } => {
                format!("CREATE DATABASE {} OWNER {}", database.quoted(), owner.quoted())
            }
            Self::AlterDatabaseOwner { database, owner } => {
                format!("ALTER DATABASE {} OWNER TO {}", database.quoted(), owner.quoted())
            }
            Self::DropDatabase { database } => {
                format!("DROP DATABASE IF EXISTS {}", database.quoted())
            }
            Self::DropRole { role } => format!("DROP ROLE IF EXISTS {}", role.quoted()),
            Self::TerminateSessions { database } => format!(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = {} AND pid <> pg_backend_pid()",
                quote_literal(database.as_str())
            ),
            Self::RoleExists { role } => format!(
                "SELECT 1 FROM pg_roles WHERE rolname = {}",
                quote_literal(role.as_str())
            ),
            Self::DatabaseOwner { database } => format!(
                "SELECT pg_get_userbyid(datdba) FROM pg_database WHERE datname = {}",
                quote_literal(database.as_str())
            ),
            Self::TableExists { schema, table } => format!(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = {} AND table_name = {}",
                quote_literal(schema.as_str()),
                quote_literal(table.as_str())
            ),
            Self::ParticipantExists { participant_id } => format!(
                "SELECT 1 FROM public.edc_participant WHERE participant_id = {}",
                quote_literal(participant_id)
            ),
            Self::DeleteParticipant { participant_id } => format!(
                "DELETE FROM public.edc_participant WHERE participant_id = {}",
                quote_literal(participant_id)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(value: &str) -> Identifier {
        Identifier::new(value).unwrap()
    }

    #[test]
    fn test_identifier_validation() {
        assert!(Identifier::new("demo_rs").is_ok());
        assert!(Identifier::new("_x1").is_ok());
        assert!(Identifier::new("Demo").is_err());
        assert!(Identifier::new("1abc").is_err());
        assert!(Identifier::new("demo; DROP TABLE x").is_err());
        assert!(Identifier::new("a".repeat(64)).is_err());
    }

    #[test]
    fn test_identifier_from_resource_name() {
        assert_eq!(
            Identifier::from_resource_name("conn-oeg-demo").unwrap().as_str(),
            "conn_oeg_demo"
        );
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_create_role_redacted() {
        let stmt = SqlStatement::CreateRole {
            role: ident("demo_rsusr"),
            password: SecretValue::new("p'w"),
        };
        assert_eq!(
            stmt.render(),
            "CREATE ROLE \"demo_rsusr\" LOGIN PASSWORD 'p''w'"
        );
        assert_eq!(
            stmt.redacted(),
            "CREATE ROLE \"demo_rsusr\" LOGIN PASSWORD '***'"
        );
        assert!(stmt.is_mutating());
    }

    #[test]
    fn test_participant_literal_injection_is_quoted() {
        let stmt = SqlStatement::DeleteParticipant {
            participant_id: "x' OR '1'='1".to_string(),
        };
        assert_eq!(
            stmt.render(),
            "DELETE FROM public.edc_participant WHERE participant_id = 'x'' OR ''1''=''1'"
        );
    }

    #[test]
    fn test_read_statements_not_mutating() {
        assert!(!SqlStatement::Ping.is_mutating());
        assert!(!SqlStatement::RoleExists { role: ident("r") }.is_mutating());
        assert!(SqlStatement::TerminateSessions { database: ident("d") }.is_mutating());
    }

    #[test]
    fn test_endpoint_urls() {
        let endpoint = DatabaseEndpoint {
            namespace: "common-srvs".to_string(),
            service: "common-srvs-postgresql".to_string(),
            pod: "common-srvs-postgresql-0".to_string(),
            port: 5432,
        };
        assert_eq!(
            endpoint.jdbc_url(&ident("demo_rs")),
            "jdbc:postgresql://common-srvs-postgresql.common-srvs:5432/demo_rs"
        );
        assert_eq!(endpoint.fqdn(), "common-srvs-postgresql.common-srvs.svc");
    }
}
