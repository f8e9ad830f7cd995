use async_graphql::{
    Context, EmptySubscription, ErrorExtensions, InputObject, Object, Result as GraphQLResult, Schema,
    SimpleObject, Upload,
};
use std::io::Read;

use crate::models::*;
use crate::sync::{ImportEngine, PreparedImport};

pub type ImportSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema(engine: ImportEngine) -> ImportSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(engine)
        .finish()
}

/// Surface the error class so drivers can tell a bad request from a failing source.
fn gql_error(e: ImportError) -> async_graphql::Error {
    let class = format!("{:?}", e.class()).to_uppercase();
    async_graphql::Error::new(e.to_string()).extend_with(|_, ext| ext.set("code", class))
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Current counters of an import session
    async fn import_progress(&self, ctx: &Context<'_>, token: String) -> GraphQLResult<ImportProgress> {
        let engine = ctx.data::<ImportEngine>()?;
        let progress = engine.progress(&token).await.map_err(gql_error)?;
        Ok(progress.into())
    }

    /// Field types a CSV column can be mapped to
    async fn allowed_field_types(&self) -> Vec<FieldTypeOption> {
        FieldType::ALL.iter().map(FieldTypeOption::from).collect()
    }

    /// Health check
    async fn health(&self) -> GraphQLResult<String> {
        Ok("OK".to_string())
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Store an uploaded CSV and open an import session for it
    async fn prepare_import(&self, ctx: &Context<'_>, file: Upload) -> GraphQLResult<PreparedImportResult> {
        let engine = ctx.data::<ImportEngine>()?;
        let upload = file.value(ctx)?;
        let filename = upload.filename.clone();

        let mut bytes = Vec::new();
        upload.into_read().read_to_end(&mut bytes)?;

        let prepared = engine.prepare_upload(&filename, &bytes).await.map_err(gql_error)?;
        Ok(prepared.into())
    }

    /// Import the next batch of rows. The mapping is only read on the first call.
    async fn process_batch(
        &self,
        ctx: &Context<'_>,
        token: String,
        mapping: Option<Vec<ColumnMappingInputGql>>,
        skip_duplicates: Option<bool>,
    ) -> GraphQLResult<ImportProgress> {
        let engine = ctx.data::<ImportEngine>()?;
        let request = mapping.map(|columns| BatchRequest {
            columns: columns.into_iter().map(Into::into).collect(),
            skip_duplicates: skip_duplicates.unwrap_or(false),
        });
        let progress = engine
            .process_batch(&token, request.as_ref())
            .await
            .map_err(gql_error)?;
        Ok(progress.into())
    }

    /// Retry the rows that failed so far
    async fn retry_failed(&self, ctx: &Context<'_>, token: String) -> GraphQLResult<ImportProgress> {
        let engine = ctx.data::<ImportEngine>()?;
        let progress = engine.retry_failed(&token).await.map_err(gql_error)?;
        Ok(progress.into())
    }
}

#[derive(InputObject)]
#[graphql(name = "ColumnMappingInput")]
pub struct ColumnMappingInputGql {
    pub header: String,
    pub field_type: String,
    pub meta_key: Option<String>,
}

impl From<ColumnMappingInputGql> for ColumnMappingInput {
    fn from(input: ColumnMappingInputGql) -> Self {
        Self {
            header: input.header,
            field_type: input.field_type,
            meta_key: input.meta_key,
        }
    }
}

#[derive(SimpleObject)]
pub struct FieldTypeOption {
    pub value: String,
    pub label: String,
}

impl From<&FieldType> for FieldTypeOption {
    fn from(field: &FieldType) -> Self {
        Self {
            value: field.as_str().to_string(),
            label: field.label().to_string(),
        }
    }
}

#[derive(SimpleObject)]
pub struct PreparedImportResult {
    pub token: String,
    pub headers: Vec<String>,
    pub allowed_field_types: Vec<FieldTypeOption>,
}

impl From<PreparedImport> for PreparedImportResult {
    fn from(prepared: PreparedImport) -> Self {
        Self {
            token: prepared.token,
            headers: prepared.headers,
            allowed_field_types: prepared.allowed_field_types.iter().map(FieldTypeOption::from).collect(),
        }
    }
}

#[derive(SimpleObject)]
pub struct ImportProgress {
    pub token: String,
    pub imported: i64,
    pub skipped: i64,
    pub failed: i64,
    pub total: i64,
    pub cursor: i64,
    pub done: bool,
    pub retryable: bool,
    pub state: String,
}

impl From<BatchProgress> for ImportProgress {
    fn from(p: BatchProgress) -> Self {
        Self {
            token: p.token,
            imported: p.imported as i64,
            skipped: p.skipped as i64,
            failed: p.failed as i64,
            total: p.total as i64,
            cursor: p.cursor as i64,
            done: p.done,
            retryable: p.retryable,
            state: format!("{:?}", p.state).to_uppercase(),
        }
    }
}
