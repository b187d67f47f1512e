//! Per-table operations.

use serde::Deserialize;
use serde_json::Value;

use super::Dbo;
use crate::db::Row;
use crate::error::{Error, Result};
use crate::joins::JoinGraph;
use crate::mutation::{
    self, DeleteParams, InsertParams, MutationContext, MutationResult, UpdateParams,
};
use crate::filter::FilterParams;
use crate::query::{
    build_filter, build_query, count_sql, emit, size_sql, QueryContext, QueryRequest,
};
use crate::rules::Command;
use crate::schema::Schema;

/// Options of `find`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindParams {
    /// Projection; null or `"*"` selects every allowed column.
    pub select: Value,
    /// Sort spec.
    pub order_by: Option<Value>,
    /// Row cap.
    pub limit: Option<u64>,
    /// Rows skipped.
    pub offset: Option<u64>,
    /// Fails unless exactly one row matches.
    pub expect_one: bool,
}

impl FindParams {
    pub(crate) fn to_request(&self, filter: &Value) -> QueryRequest {
        QueryRequest {
            filter: filter.clone(),
            select: self.select.clone(),
            order_by: self.order_by.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

/// Operations on one table or view, authorized by the owning [`Dbo`].
///
/// Every error is wrapped with the table and operation name.
#[derive(Debug, Clone)]
pub struct TableHandle {
    dbo: Dbo,
    name: String,
}

impl TableHandle {
    pub(crate) fn new(dbo: Dbo, name: &str) -> Self {
        Self {
            dbo,
            name: name.to_string(),
        }
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn dbo(&self) -> &Dbo {
        &self.dbo
    }

    /// Rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Permission, validation and join errors before any SQL runs; database
    /// errors; [`Error::ExpectedOne`] with `expect_one`.
    pub async fn find(&self, filter: &Value, params: &FindParams) -> Result<Vec<Row>> {
        self.find_inner(filter, params)
            .await
            .map_err(|e| e.within(&self.name, "find"))
    }

    async fn find_inner(&self, filter: &Value, params: &FindParams) -> Result<Vec<Row>> {
        let schema = self.dbo.schema();
        let joins = self.dbo.joins();
        let ctx = self.dbo.query_context(&schema, &joins);
        let node = build_query(ctx, &self.name, &params.to_request(filter)).await?;
        let sql = emit(&node);
        tracing::trace!(table = %self.name, sql = %sql, "find");
        let rows = self.dbo.client().query(&sql, &node.params).await?;
        if params.expect_one && rows.len() != 1 {
            return Err(Error::ExpectedOne(rows.len()));
        }
        Ok(rows)
    }

    /// First row matching `filter`, if any.
    ///
    /// # Errors
    ///
    /// Same as [`Self::find`].
    pub async fn find_one(&self, filter: &Value, params: &FindParams) -> Result<Option<Row>> {
        let params = FindParams {
            limit: Some(1),
            expect_one: false,
            ..params.clone()
        };
        let rows = self
            .find_inner(filter, &params)
            .await
            .map_err(|e| e.within(&self.name, "findOne"))?;
        Ok(rows.into_iter().next())
    }

    /// Number of rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Permission and validation errors, database errors.
    pub async fn count(&self, filter: &Value) -> Result<u64> {
        self.aggregate(filter, false)
            .await
            .map_err(|e| e.within(&self.name, "count"))
    }

    /// Bytes taken by the allowed columns of the rows matching `filter`.
    ///
    /// # Errors
    ///
    /// Permission and validation errors, database errors.
    pub async fn size(&self, filter: &Value) -> Result<u64> {
        self.aggregate(filter, true)
            .await
            .map_err(|e| e.within(&self.name, "size"))
    }

    async fn aggregate(&self, filter: &Value, size: bool) -> Result<u64> {
        let schema = self.dbo.schema();
        let joins = self.dbo.joins();
        let bound = FilterParams::new();
        let ctx = QueryContext {
            params: Some(&bound),
            ..self.dbo.query_context(&schema, &joins)
        };
        let info = schema.require(&self.name)?;
        let permit = ctx.access.permit(&self.name, Command::Select).await?;
        let rule = permit.select(&self.name)?;
        let allowed = permit.select_fields(info)?;
        let filter_allowed = match rule.and_then(|r| r.filter_fields.as_ref()) {
            Some(fields) => fields.resolve(info)?,
            None => allowed.clone(),
        };
        let compiled = build_filter(
            ctx,
            info,
            filter,
            &filter_allowed,
            rule.and_then(|r| r.forced_filter.as_ref()),
            &[],
        )
        .await?;
        if !compiled.having_sql.is_empty() {
            return Err(Error::Validation("aggregate filters are not allowed here".into()));
        }

        let (sql, column) = if size {
            (size_sql(info, &allowed, &compiled.where_sql), "size")
        } else {
            (count_sql(info, &compiled.where_sql), "count")
        };
        let rows = self.dbo.client().query(&sql, &bound.take()).await?;
        let value = rows
            .first()
            .and_then(|row| row.get(column))
            .ok_or_else(|| Error::Internal(format!("{column} query returned no row")))?;
        as_count(value).ok_or_else(|| Error::Internal(format!("unexpected {column} value {value}")))
    }

    fn mutation_context<'a>(&'a self, schema: &'a Schema, joins: &'a JoinGraph) -> MutationContext<'a> {
        MutationContext {
            query: self.dbo.query_context(schema, joins),
            db: self.dbo.client(),
            tx: self.dbo.tx(),
        }
    }

    /// Inserts a row (object) or rows (array).
    ///
    /// # Errors
    ///
    /// See [`mutation::insert`].
    pub async fn insert(&self, data: &Value, params: &InsertParams) -> Result<MutationResult> {
        let schema = self.dbo.schema();
        let joins = self.dbo.joins();
        mutation::insert(self.mutation_context(&schema, &joins), &self.name, data, params)
            .await
            .map_err(|e| e.within(&self.name, "insert"))
    }

    /// Updates the rows matching `filter`.
    ///
    /// # Errors
    ///
    /// See [`mutation::update`].
    pub async fn update(
        &self,
        filter: &Value,
        data: &Value,
        params: &UpdateParams,
    ) -> Result<MutationResult> {
        let schema = self.dbo.schema();
        let joins = self.dbo.joins();
        mutation::update(self.mutation_context(&schema, &joins), &self.name, filter, data, params)
            .await
            .map_err(|e| e.within(&self.name, "update"))
    }

    /// Updates the rows matching `filter` or inserts one.
    ///
    /// # Errors
    ///
    /// See [`mutation::upsert`].
    pub async fn upsert(
        &self,
        filter: &Value,
        data: &Value,
        params: &UpdateParams,
    ) -> Result<MutationResult> {
        let schema = self.dbo.schema();
        let joins = self.dbo.joins();
        mutation::upsert(self.mutation_context(&schema, &joins), &self.name, filter, data, params)
            .await
            .map_err(|e| e.within(&self.name, "upsert"))
    }

    /// Deletes the rows matching `filter`.
    ///
    /// # Errors
    ///
    /// See [`mutation::delete`].
    pub async fn delete(&self, filter: &Value, params: &DeleteParams) -> Result<MutationResult> {
        let schema = self.dbo.schema();
        let joins = self.dbo.joins();
        mutation::delete(self.mutation_context(&schema, &joins), &self.name, filter, params)
            .await
            .map_err(|e| e.within(&self.name, "delete"))
    }
}

// int8 comes back as a number, or as text from drivers that stringify it.
fn as_count(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
