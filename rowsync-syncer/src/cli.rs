use clap::Parser;

/// Configuration of one syncer process. Every flag can come from the
/// environment, which is how deployments configure it.
#[derive(Parser, Debug, Clone)]
#[command(name = "rowsync-syncer", version, about = "Synchronized query cache syncer")]
pub struct Args {
    /// CVR database connection string.
    #[arg(long, env = "ROWSYNC_DATABASE_URL")]
    pub database_url: String,

    /// Replica database connection string; defaults to the CVR database.
    #[arg(long, env = "ROWSYNC_REPLICA_URL")]
    pub replica_url: Option<String>,

    #[arg(long, env = "ROWSYNC_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "ROWSYNC_PORT", default_value_t = 4848)]
    pub port: u16,

    /// URL prefix of the exposed endpoints.
    #[arg(long, env = "ROWSYNC_PREFIX", default_value = "v1")]
    pub prefix: String,

    /// Port the prometheus exporter listens on.
    #[arg(long, env = "ROWSYNC_METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    /// Synced tables with their primary keys, `table:col[,col...]`.
    /// Repeat the flag per table.
    #[arg(long = "table", value_parser = parse_table_spec)]
    pub tables: Vec<TableSpec>,

    /// Stable identity of this syncer process, used for CVR ownership.
    /// Defaults to a random id per start.
    #[arg(long, env = "ROWSYNC_TASK_ID")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub table: String,
    pub primary_key: Vec<String>,
}

fn parse_table_spec(raw: &str) -> Result<TableSpec, String> {
    let (table, key) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `table:col[,col...]`, got `{raw}`"))?;
    if table.is_empty() {
        return Err("table name may not be empty".to_string());
    }
    let primary_key: Vec<String> = key
        .split(',')
        .map(str::trim)
        .filter(|col| !col.is_empty())
        .map(str::to_owned)
        .collect();
    if primary_key.is_empty() {
        return Err(format!("table `{table}` needs at least one key column"));
    }
    Ok(TableSpec { table: table.to_owned(), primary_key })
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("issues:id", "issues", &["id"])]
    #[case("labels:issue_id, name", "labels", &["issue_id", "name"])]
    fn test_parses_table_specs(#[case] raw: &str, #[case] table: &str, #[case] key: &[&str]) {
        let spec = parse_table_spec(raw).unwrap();

        assert_eq!(spec.table, table);
        assert_eq!(spec.primary_key, key);
    }

    #[rstest]
    #[case("issues")]
    #[case(":id")]
    #[case("issues:")]
    fn test_rejects_malformed_specs(#[case] raw: &str) {
        assert!(parse_table_spec(raw).is_err());
    }
}
