//! Database administration through `psql` inside the server pod.
//!
//! Sessions run via `kubectl exec`. The password is the first line on stdin
//! and the statement follows it, so neither appears in any argument vector.

use async_trait::async_trait;
use tracing::debug;

use provisionflow::errors::CollaboratorError;
use provisionflow::ports::{CollaboratorResult, DatabaseAdmin, DatabaseConnection, SqlStatement};

use super::{ProcessError, ToolRunner};

const SYSTEM: &str = "postgres";

/// Reads the password from stdin, then hands the rest of stdin to `psql`.
const SESSION_SCRIPT: &str = "IFS= read -r PGPASSWORD; export PGPASSWORD; \
exec psql -X -h 127.0.0.1 -p \"$3\" -U \"$1\" -d \"$2\" -v ON_ERROR_STOP=1 -tA -F '|' -f -";

/// [`DatabaseAdmin`] that executes statements with `psql` in the database pod.
#[derive(Debug, Clone)]
pub struct PsqlDatabase {
    kubectl: ToolRunner,
}

impl PsqlDatabase {
    /// Creates the adapter on top of a `kubectl` runner.
    #[must_use]
    pub fn new(kubectl: ToolRunner) -> Self {
        Self { kubectl }
    }

    async fn session(
        &self,
        connection: &DatabaseConnection,
        statement: &SqlStatement,
    ) -> CollaboratorResult<String> {
        debug!(
            database = %connection.database,
            user = %connection.user,
            statement = %statement.redacted(),
            "Running SQL"
        );
        let endpoint = &connection.endpoint;
        let args = vec![
            "exec".to_string(),
            "-i".to_string(),
            "-n".to_string(),
            endpoint.namespace.clone(),
            endpoint.pod.clone(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            SESSION_SCRIPT.to_string(),
            "sh".to_string(),
            connection.user.clone(),
            connection.database.to_string(),
            endpoint.port.to_string(),
        ];
        let stdin = format!("{}\n{};\n", connection.password.expose(), statement.render());
        self.kubectl
            .run_with(&args, Some(stdin.as_bytes()), self.kubectl.timeout())
            .await
            .map(|output| output.stdout)
            .map_err(session_error)
    }
}

/// A missing pod means the server is down, not that the object is missing.
fn session_error(err: ProcessError) -> CollaboratorError {
    if err.is_not_found() {
        CollaboratorError::unavailable(SYSTEM, err.to_string())
    } else if err.stderr().contains("ERROR:") {
        CollaboratorError::rejected(SYSTEM, err.stderr().to_string())
    } else {
        err.into_collaborator(SYSTEM)
    }
}

/// Parses unaligned, tuples-only output into rows of columns.
fn parse_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('|').map(str::to_string).collect())
        .collect()
}

/// Reads the affected-row count from a command tag such as `DELETE 1`.
fn affected_rows(stdout: &str) -> u64 {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|tag| tag.split_whitespace().last())
        .and_then(|count| count.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl DatabaseAdmin for PsqlDatabase {
    async fn execute(
        &self,
        connection: &DatabaseConnection,
        statement: &SqlStatement,
    ) -> CollaboratorResult<u64> {
        self.session(connection, statement)
            .await
            .map(|stdout| affected_rows(&stdout))
    }

    async fn query(
        &self,
        connection: &DatabaseConnection,
        statement: &SqlStatement,
    ) -> CollaboratorResult<Vec<Vec<String>>> {
        self.session(connection, statement)
            .await
            .map(|stdout| parse_rows(&stdout))
    }
}
