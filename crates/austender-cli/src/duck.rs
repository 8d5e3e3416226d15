//! DuckDB pass-through for ad-hoc analytics over the cached parquet
//! files. Shells out to the external `duckdb` binary to avoid linking a
//! second database engine.

use std::path::Path;

use austender_core::CollectError;
use tokio::process::Command;

/// Run `sql` (or the default agency/year aggregation) against every
/// parquet part under the lake. `{{PARQUET_GLOB}}` in the SQL is replaced
/// with the lake glob.
pub async fn run_duckdb_query(
    cache_dir: &Path,
    sql: &str,
    limit: usize,
) -> Result<(), CollectError> {
    let lake_dir = cache_dir.join("lake");
    if !lake_dir.is_dir() {
        return Err(CollectError::InvalidArgument(format!(
            "lake not found at {}; run `austender cache` first",
            lake_dir.display()
        )));
    }

    let glob = cache_dir
        .join("lake")
        .join("**")
        .join("*.parquet")
        .to_string_lossy()
        .into_owned();
    let sql = if sql.trim().is_empty() {
        default_analytics_sql(limit)
    } else {
        sql.to_string()
    };
    let sql = sql.replace("{{PARQUET_GLOB}}", &glob);

    let status = Command::new("duckdb")
        .arg("-json")
        .arg("-c")
        .arg(&sql)
        .status()
        .await
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                CollectError::InvalidArgument(
                    "duckdb CLI not found in PATH; install from https://duckdb.org/docs/installation"
                        .into(),
                )
            } else {
                CollectError::CacheIo(format!("running duckdb: {err}"))
            }
        })?;

    if !status.success() {
        return Err(CollectError::CacheIo(format!(
            "duckdb exited with {status}"
        )));
    }
    Ok(())
}

fn default_analytics_sql(limit: usize) -> String {
    format!(
        "with data as (
  select
    financial_year,
    agency,
    sum(amount) as total_amount,
    count(*) as records
  from parquet_scan('{{{{PARQUET_GLOB}}}}')
  group by 1, 2
)
select * from data order by total_amount desc limit {limit};"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sql_keeps_glob_placeholder() {
        let sql = default_analytics_sql(20);
        assert!(sql.contains("{{PARQUET_GLOB}}"));
        assert!(sql.contains("limit 20"));
        assert!(sql.contains("financial_year"));
    }

    #[tokio::test]
    async fn missing_lake_is_an_invalid_argument() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_duckdb_query(dir.path(), "", 5).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
