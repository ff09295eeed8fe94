//! Concrete [`PlanProvider`]/[`MetadataSource`] implementations backed by the
//! real connection pool. Kept here (rather than in `analysis/`) because they
//! are the only code that needs to know about `DbClient`; the analyzers
//! themselves only see the trait.

use crate::analysis::metadata::{MetadataSource, TableMetadata};
use crate::analysis::plan::PlanProvider;
use crate::error::{GatewayError, GatewayResult};
use crate::pool::ConnectionPool;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use tiberius::{ColumnData, QueryItem};

pub struct PoolPlanProvider<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> PoolPlanProvider<'a> {
    pub fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<'a> PlanProvider for PoolPlanProvider<'a> {
    async fn get_showplan_xml(&self, env: &str, caller: &str, sql: &str) -> GatewayResult<String> {
        self.pool
            .with_connection(env, caller, |client| {
                let sql = sql.to_string();
                Box::pin(async move {
                    client
                        .simple_query("SET SHOWPLAN_XML ON")
                        .await
                        .map_err(|e| GatewayError::DbError(e.to_string()))?
                        .into_results()
                        .await
                        .map_err(|e| GatewayError::DbError(e.to_string()))?;

                    let mut stream =
                        client.simple_query(sql).await.map_err(|e| GatewayError::DbError(e.to_string()))?;
                    let mut xml = String::new();
                    while let Some(item) =
                        stream.try_next().await.map_err(|e| GatewayError::DbError(e.to_string()))?
                    {
                        if let QueryItem::Row(row) = item
                            && let Some(ColumnData::String(Some(fragment))) = row.into_iter().next()
                        {
                            xml.push_str(&fragment);
                        }
                    }

                    client
                        .simple_query("SET SHOWPLAN_XML OFF")
                        .await
                        .map_err(|e| GatewayError::DbError(e.to_string()))?
                        .into_results()
                        .await
                        .map_err(|e| GatewayError::DbError(e.to_string()))?;

                    Ok(xml)
                })
            })
            .await
    }
}

pub struct PoolMetadataSource<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> PoolMetadataSource<'a> {
    pub fn new(pool: &'a ConnectionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<'a> MetadataSource for PoolMetadataSource<'a> {
    async fn table_metadata(
        &self,
        env: &str,
        caller: &str,
        tables: &[String],
    ) -> GatewayResult<Vec<TableMetadata>> {
        let mut results = Vec::with_capacity(tables.len());
        for table in tables {
            let table = table.clone();
            let metadata = self
                .pool
                .with_connection(env, caller, |client| {
                    let table = table.clone();
                    Box::pin(async move { fetch_one_table_metadata(client, &table).await })
                })
                .await?;
            results.push(metadata);
        }
        Ok(results)
    }
}

/// Builds the one-table DMV sweep behind `schema_summary`/metadata findings.
/// `table` is a dotted identifier already produced by the AST visitor (never
/// user-composed SQL text), so it is safe to splice into `OBJECT_ID()`'s
/// string-literal argument. Each subquery maps to one BP03x/BP04x rule in
/// [`crate::analysis::metadata::MetadataAnalyzer`]; a table that doesn't
/// exist short-circuits to a bare not-found row.
async fn fetch_one_table_metadata(
    client: &mut crate::pool::DbClient,
    table: &str,
) -> GatewayResult<TableMetadata> {
    let escaped = table.replace('\'', "''");
    let query = format!(
        "DECLARE @obj INT = OBJECT_ID('{escaped}'); \
         SELECT \
            @obj AS object_id, \
            ISNULL((SELECT SUM(p.rows) FROM sys.partitions p WHERE p.object_id = @obj AND p.index_id IN (0, 1)), 0) AS row_count, \
            (SELECT COUNT(*) FROM sys.columns c WHERE c.object_id = @obj) AS column_count, \
            (SELECT MAX(DATEDIFF(DAY, STATS_DATE(s.object_id, s.stats_id), GETDATE())) FROM sys.stats s WHERE s.object_id = @obj) AS stats_age_days, \
            (SELECT MAX(ips.avg_fragmentation_in_percent) FROM sys.dm_db_index_physical_stats(DB_ID(), @obj, NULL, NULL, 'LIMITED') ips WHERE ips.page_count > 1000) AS max_fragmentation_percent, \
            (SELECT COUNT(*) FROM sys.columns c WHERE c.object_id = @obj AND NOT EXISTS (SELECT 1 FROM sys.stats_columns sc JOIN sys.stats s ON s.stats_id = sc.stats_id AND s.object_id = sc.object_id WHERE sc.object_id = c.object_id AND sc.column_id = c.column_id)) AS missing_stats_count, \
            (SELECT COUNT(*) FROM sys.indexes i LEFT JOIN sys.dm_db_index_usage_stats u ON u.object_id = i.object_id AND u.index_id = i.index_id AND u.database_id = DB_ID() WHERE i.object_id = @obj AND i.index_id > 0 AND i.is_unique = 0 AND i.is_primary_key = 0 AND ISNULL(u.user_seeks, 0) + ISNULL(u.user_scans, 0) + ISNULL(u.user_lookups, 0) = 0) AS unused_index_count, \
            (SELECT COUNT(*) - COUNT(DISTINCT leading_column_id) FROM (SELECT ic.index_id, MIN(ic.column_id) AS leading_column_id FROM sys.index_columns ic WHERE ic.object_id = @obj AND ic.key_ordinal = 1 GROUP BY ic.index_id) lead) AS duplicate_index_count, \
            CASE WHEN EXISTS (SELECT 1 FROM sys.indexes i WHERE i.object_id = @obj AND i.index_id = 1) THEN 0 ELSE 1 END AS is_heap, \
            CASE WHEN EXISTS (SELECT 1 FROM sys.partition_schemes ps JOIN sys.indexes i ON i.data_space_id = ps.data_space_id WHERE i.object_id = @obj) THEN 1 ELSE 0 END AS is_partitioned, \
            CASE WHEN EXISTS (SELECT 1 FROM sys.indexes i WHERE i.object_id = @obj AND i.type IN (5, 6)) THEN 1 ELSE 0 END AS has_columnstore_index, \
            CASE WHEN EXISTS (SELECT 1 FROM sys.columns c WHERE c.object_id = @obj AND c.max_length = -1) THEN 1 ELSE 0 END AS has_max_length_column, \
            CASE WHEN EXISTS ( \
                SELECT 1 FROM sys.foreign_key_columns fkc \
                WHERE fkc.parent_object_id = @obj \
                AND NOT EXISTS ( \
                    SELECT 1 FROM sys.index_columns ic \
                    WHERE ic.object_id = fkc.parent_object_id \
                    AND ic.column_id = fkc.parent_column_id \
                    AND ic.key_ordinal = 1 \
                ) \
            ) THEN 1 ELSE 0 END AS has_fk_without_leading_index"
    );

    let stream = client.query(query, &[]).await.map_err(|e| GatewayError::DbError(e.to_string()))?;
    let row = stream
        .into_row_stream()
        .try_next()
        .await
        .map_err(|e| GatewayError::DbError(e.to_string()))?;

    let Some(row) = row else {
        return Ok(not_found(table));
    };

    let object_id: Option<i32> = row.get(0);
    if object_id.is_none() {
        return Ok(not_found(table));
    }

    Ok(TableMetadata {
        name: table.to_string(),
        exists: true,
        row_count: row.get::<i64, _>(1).unwrap_or(0),
        column_count: row.get::<i32, _>(2).unwrap_or(0).max(0) as u32,
        stats_age_days: row.get::<i32, _>(3).map(i64::from),
        max_fragmentation_percent: row.get::<f64, _>(4),
        missing_stats_count: row.get::<i32, _>(5).unwrap_or(0).max(0) as u32,
        unused_index_count: row.get::<i32, _>(6).unwrap_or(0).max(0) as u32,
        duplicate_index_count: row.get::<i32, _>(7).unwrap_or(0).max(0) as u32,
        is_heap: row.get::<i32, _>(8).unwrap_or(0) == 1,
        is_partitioned: row.get::<i32, _>(9).unwrap_or(0) == 1,
        has_columnstore_index: row.get::<i32, _>(10).unwrap_or(0) == 1,
        has_max_length_column: row.get::<i32, _>(11).unwrap_or(0) == 1,
        has_fk_without_leading_index: row.get::<i32, _>(12).unwrap_or(0) == 1,
    })
}

/// Backs the `schema_summary` tool: a catalog-wide sweep (not scoped to
/// tables a script references), optionally filtered by `search_term`
/// against the table name. Each result line is one table with its columns
/// inlined, truncated to stay within the response budget for wide tables.
pub async fn schema_summary(
    pool: &ConnectionPool,
    env: &str,
    caller: &str,
    search_term: Option<&str>,
) -> GatewayResult<Vec<String>> {
    let search_term = search_term.map(|s| s.to_string());
    pool.with_connection(env, caller, |client| {
        let search_term = search_term.clone();
        Box::pin(async move { fetch_schema_summary(client, search_term.as_deref()).await })
    })
    .await
}

const SUMMARY_LINE_MAX_CHARS: usize = 500;

async fn fetch_schema_summary(
    client: &mut crate::pool::DbClient,
    search_term: Option<&str>,
) -> GatewayResult<Vec<String>> {
    let filter = match search_term {
        Some(term) => format!("WHERE t.name LIKE '%{}%'", term.replace('\'', "''")),
        None => String::new(),
    };
    let query = format!(
        "SELECT s.name AS schema_name, t.name AS table_name, c.name AS column_name, ty.name AS type_name \
         FROM sys.tables t \
         JOIN sys.schemas s ON s.schema_id = t.schema_id \
         JOIN sys.columns c ON c.object_id = t.object_id \
         JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
         {filter} \
         ORDER BY s.name, t.name, c.column_id"
    );

    let stream = client.query(query, &[]).await.map_err(|e| GatewayError::DbError(e.to_string()))?;
    let mut rows_stream = stream.into_row_stream();

    let mut order: Vec<String> = Vec::new();
    let mut columns: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();

    while let Some(row) = rows_stream.try_next().await.map_err(|e| GatewayError::DbError(e.to_string()))? {
        let schema: &str = row.get(0).unwrap_or("");
        let table: &str = row.get(1).unwrap_or("");
        let column: &str = row.get(2).unwrap_or("");
        let ty: &str = row.get(3).unwrap_or("");
        let key = format!("{schema}.{table}");
        columns.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Vec::new()
        });
        columns.get_mut(&key).expect("just inserted").push(format!("{column} ({ty})"));
    }

    let summary = order
        .into_iter()
        .map(|key| {
            let cols = columns.remove(&key).unwrap_or_default();
            let mut line = format!("TABLE {key}: {}", cols.join(", "));
            if line.len() > SUMMARY_LINE_MAX_CHARS {
                line.truncate(SUMMARY_LINE_MAX_CHARS);
            }
            line
        })
        .collect();

    Ok(summary)
}

fn not_found(table: &str) -> TableMetadata {
    TableMetadata {
        name: table.to_string(),
        exists: false,
        row_count: 0,
        column_count: 0,
        stats_age_days: None,
        max_fragmentation_percent: None,
        missing_stats_count: 0,
        unused_index_count: 0,
        duplicate_index_count: 0,
        is_heap: false,
        is_partitioned: false,
        has_columnstore_index: false,
        has_max_length_column: false,
        has_fk_without_leading_index: false,
    }
}
