//! MongoDB connector.
//!
//! `execute_query` takes a JSON operation document decoded into
//! [`MongoOperation`]. Filters and documents accept Extended JSON; results
//! are rendered as relaxed Extended JSON. Table structure is inferred from a
//! bounded sample of each collection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::{
    AggregateOptions, ClientOptions, CountOptions, FindOneOptions, FindOptions,
    UpdateModifications,
};
use mongodb::{Client, Collection, Database};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use common::config::DialectDefaults;
use common::errors::{AppError, AppResult};
use common::models::{
    ColumnInfo, ConnectArgs, DbType, IndexInfo, IndexKind, InsertRows, QueryOutcome, Record,
    TableStructure, WriteSummary,
};

use super::options::resolve_url;
use super::{connection_error, query_error, wrong_handle, ConnectionHandle, Connector, PoolSettings};

/// Documents read when inferring a collection's structure.
pub const SAMPLE_SIZE: i64 = 100;

const ID_FIELD: &str = "_id";
const ID_INDEX: &str = "_id_";

/// Actions accepted in the `action` field.
pub const ACTIONS: [&str; 11] = [
    "find",
    "findOne",
    "insertOne",
    "insertMany",
    "updateOne",
    "updateMany",
    "deleteOne",
    "deleteMany",
    "aggregate",
    "count",
    "distinct",
];

/// Live MongoDB client bound to one database.
#[derive(Clone)]
pub struct MongoHandle {
    client: Client,
    database: String,
    closed: Arc<AtomicBool>,
}

impl MongoHandle {
    fn database(&self) -> AppResult<Database> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(connection_error(DbType::MongoDB, "connection is closed"));
        }
        Ok(self.client.database(&self.database))
    }

    fn collection(&self, name: &str) -> AppResult<Collection<Document>> {
        Ok(self.database()?.collection::<Document>(name))
    }
}

/// One document-store operation, tagged by `action`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum MongoOperation {
    Find {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        projection: Option<Document>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        sort: Option<Document>,
        #[serde(default)]
        skip: Option<u64>,
        #[serde(default)]
        limit: Option<i64>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        options: Option<Document>,
    },
    FindOne {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        projection: Option<Document>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        options: Option<Document>,
    },
    InsertOne {
        #[serde(deserialize_with = "ext_document")]
        document: Document,
    },
    InsertMany {
        #[serde(deserialize_with = "ext_documents_non_empty")]
        documents: Vec<Document>,
    },
    UpdateOne {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
        #[serde(deserialize_with = "ext_update")]
        update: UpdateModifications,
        #[serde(default)]
        upsert: bool,
    },
    UpdateMany {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
        #[serde(deserialize_with = "ext_update")]
        update: UpdateModifications,
        #[serde(default)]
        upsert: bool,
    },
    DeleteOne {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
    },
    DeleteMany {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
    },
    Aggregate {
        #[serde(deserialize_with = "ext_documents")]
        pipeline: Vec<Document>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        options: Option<Document>,
    },
    Count {
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
        #[serde(default, deserialize_with = "ext_document_opt")]
        options: Option<Document>,
    },
    Distinct {
        field: String,
        #[serde(default, deserialize_with = "ext_document_opt")]
        filter: Option<Document>,
    },
}

/// A parsed `execute_query` request.
#[derive(Debug, Clone)]
pub struct MongoQuery {
    pub collection: String,
    pub operation: MongoOperation,
}

fn malformed(message: impl std::fmt::Display) -> AppError {
    AppError::MalformedQuery(format!("MongoDB: {message}"))
}

/// Parses query text into a [`MongoQuery`].
///
/// Unknown actions are rejected before any variant field is decoded.
pub fn parse_query(text: &str) -> AppResult<MongoQuery> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| malformed(format!("invalid query JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| malformed("query must be a JSON object"))?;

    let collection = object
        .get("collection")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| malformed("query must name a 'collection'"))?
        .to_string();
    let action = object
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("query must name an 'action'"))?;
    if !ACTIONS.contains(&action) {
        return Err(AppError::UnsupportedOperation(format!(
            "MongoDB: unsupported action '{action}'"
        )));
    }

    let operation = MongoOperation::deserialize(&value)
        .map_err(|e| malformed(format!("invalid '{action}' query: {e}")))?;
    Ok(MongoQuery {
        collection,
        operation,
    })
}

/// Converts Extended JSON into a BSON document.
fn json_to_document(value: Value) -> Result<Document, String> {
    match Bson::try_from(value).map_err(|e| e.to_string())? {
        Bson::Document(doc) => Ok(doc),
        other => Err(format!("expected a document, found {other}")),
    }
}

fn ext_document<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Document, D::Error> {
    json_to_document(Value::deserialize(deserializer)?).map_err(D::Error::custom)
}

fn ext_document_opt<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Document>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        value => json_to_document(value).map(Some).map_err(D::Error::custom),
    }
}

fn ext_documents<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Document>, D::Error> {
    Vec::<Value>::deserialize(deserializer)?
        .into_iter()
        .map(json_to_document)
        .collect::<Result<_, _>>()
        .map_err(D::Error::custom)
}

fn ext_documents_non_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<Document>, D::Error> {
    let documents = ext_documents(deserializer)?;
    if documents.is_empty() {
        return Err(D::Error::custom("'documents' must not be empty"));
    }
    Ok(documents)
}

/// An update document or an aggregation pipeline.
fn ext_update<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<UpdateModifications, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Array(stages) => stages
            .into_iter()
            .map(json_to_document)
            .collect::<Result<Vec<_>, _>>()
            .map(UpdateModifications::Pipeline)
            .map_err(D::Error::custom),
        value => json_to_document(value)
            .map(UpdateModifications::Document)
            .map_err(D::Error::custom),
    }
}

/// Decodes an `options` document into a driver option type.
fn decode_options<T: DeserializeOwned + Default>(options: Option<Document>) -> AppResult<T> {
    match options {
        None => Ok(T::default()),
        Some(doc) => bson::from_document(doc).map_err(|e| malformed(format!("invalid options: {e}"))),
    }
}

fn to_json(bson: Bson) -> Value {
    bson.into_relaxed_extjson()
}

fn document_to_json(doc: Document) -> Value {
    to_json(Bson::Document(doc))
}

/// Union of document keys in first-seen order.
fn union_keys(docs: &[Document]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for key in docs.iter().flat_map(Document::keys) {
        if !keys.iter().any(|k| k == key) {
            keys.push(key.clone());
        }
    }
    keys
}

fn documents_outcome(docs: Vec<Document>) -> QueryOutcome {
    let fields = union_keys(&docs);
    let results = docs.into_iter().map(document_to_json).collect();
    QueryOutcome::rows(results, fields)
}

/// Primitive type name of a BSON value, or `None` for null.
fn type_name(value: &Bson) -> Option<&'static str> {
    match value {
        Bson::Null | Bson::Undefined => None,
        Bson::Double(_) | Bson::Int32(_) | Bson::Int64(_) | Bson::Decimal128(_) => Some("number"),
        Bson::String(_) | Bson::Symbol(_) => Some("string"),
        Bson::Boolean(_) => Some("boolean"),
        Bson::Document(_) => Some("object"),
        Bson::Array(_) => Some("array"),
        Bson::DateTime(_) | Bson::Timestamp(_) => Some("date"),
        Bson::ObjectId(_) => Some("objectId"),
        Bson::Binary(_) => Some("binary"),
        _ => Some("other"),
    }
}

/// Infers columns from a sample of documents.
///
/// Fields keep first-seen order and exclude `_id`. A field whose observed
/// type varies is `mixed`; a field that is absent from some document or
/// holds null is nullable. Fields only ever seen as null are typed `null`.
pub fn infer_columns(docs: &[Document]) -> Vec<ColumnInfo> {
    struct Observed {
        name: String,
        kind: Option<&'static str>,
        seen: usize,
        saw_null: bool,
    }

    let mut fields: Vec<Observed> = Vec::new();
    for doc in docs {
        for (key, value) in doc.iter().filter(|(k, _)| k.as_str() != ID_FIELD) {
            let index = match fields.iter().position(|f| &f.name == key) {
                Some(index) => index,
                None => {
                    fields.push(Observed {
                        name: key.clone(),
                        kind: None,
                        seen: 0,
                        saw_null: false,
                    });
                    fields.len() - 1
                }
            };
            let field = &mut fields[index];
            field.seen += 1;
            match (type_name(value), field.kind) {
                (None, _) => field.saw_null = true,
                (Some(kind), None) => field.kind = Some(kind),
                (Some(kind), Some(existing)) if kind != existing => field.kind = Some("mixed"),
                _ => {}
            }
        }
    }

    fields
        .into_iter()
        .map(|field| ColumnInfo {
            nullable: field.saw_null || field.seen < docs.len(),
            data_type: field.kind.unwrap_or("null").to_string(),
            name: field.name,
            default: None,
            primary_key: false,
            auto_increment: None,
        })
        .collect()
}

fn record_to_document(record: &Record) -> AppResult<Document> {
    json_to_document(Value::Object(record.clone()))
        .map_err(|e| AppError::Validation(format!("MongoDB: {e}")))
}

fn mongo_handle(handle: &ConnectionHandle) -> AppResult<&MongoHandle> {
    match handle {
        ConnectionHandle::Mongo(handle) => Ok(handle),
        other => Err(wrong_handle(DbType::MongoDB, other)),
    }
}

fn err(e: impl std::fmt::Display) -> AppError {
    query_error(DbType::MongoDB, e)
}

pub struct MongoConnector {
    settings: PoolSettings,
}

impl MongoConnector {
    pub fn new(settings: PoolSettings) -> Self {
        Self { settings }
    }

    async fn run(&self, collection: Collection<Document>, operation: MongoOperation) -> AppResult<QueryOutcome> {
        let outcome = match operation {
            MongoOperation::Find {
                filter,
                projection,
                sort,
                skip,
                limit,
                options,
            } => {
                let mut options: FindOptions = decode_options(options)?;
                if projection.is_some() {
                    options.projection = projection;
                }
                if sort.is_some() {
                    options.sort = sort;
                }
                if skip.is_some() {
                    options.skip = skip;
                }
                if limit.is_some() {
                    options.limit = limit;
                }
                let docs: Vec<Document> = collection
                    .find(filter.unwrap_or_default())
                    .with_options(options)
                    .await
                    .map_err(err)?
                    .try_collect()
                    .await
                    .map_err(err)?;
                documents_outcome(docs)
            }
            MongoOperation::FindOne {
                filter,
                projection,
                options,
            } => {
                let mut options: FindOneOptions = decode_options(options)?;
                if projection.is_some() {
                    options.projection = projection;
                }
                let doc = collection
                    .find_one(filter.unwrap_or_default())
                    .with_options(options)
                    .await
                    .map_err(err)?;
                documents_outcome(doc.into_iter().collect())
            }
            MongoOperation::InsertOne { document } => {
                let result = collection.insert_one(document).await.map_err(err)?;
                QueryOutcome::write(WriteSummary {
                    inserted_id: Some(to_json(result.inserted_id)),
                    ..WriteSummary::affected(1)
                })
            }
            MongoOperation::InsertMany { documents } => {
                let result = collection.insert_many(documents).await.map_err(err)?;
                let ids_len = result.inserted_ids.len() as u64;
                let mut ids: Vec<(usize, Bson)> = result.inserted_ids.into_iter().collect();
                ids.sort_by_key(|(index, _)| *index);
                QueryOutcome::write(WriteSummary {
                    inserted_ids: Some(ids.into_iter().map(|(_, id)| to_json(id)).collect()),
                    ..WriteSummary::affected(ids_len)
                })
            }
            MongoOperation::UpdateOne {
                filter,
                update,
                upsert,
            } => {
                let result = collection
                    .update_one(filter.unwrap_or_default(), update)
                    .upsert(upsert)
                    .await
                    .map_err(err)?;
                update_outcome(result.matched_count, result.modified_count, result.upserted_id)
            }
            MongoOperation::UpdateMany {
                filter,
                update,
                upsert,
            } => {
                let result = collection
                    .update_many(filter.unwrap_or_default(), update)
                    .upsert(upsert)
                    .await
                    .map_err(err)?;
                update_outcome(result.matched_count, result.modified_count, result.upserted_id)
            }
            MongoOperation::DeleteOne { filter } => {
                let result = collection
                    .delete_one(filter.unwrap_or_default())
                    .await
                    .map_err(err)?;
                delete_outcome(result.deleted_count)
            }
            MongoOperation::DeleteMany { filter } => {
                let result = collection
                    .delete_many(filter.unwrap_or_default())
                    .await
                    .map_err(err)?;
                delete_outcome(result.deleted_count)
            }
            MongoOperation::Aggregate { pipeline, options } => {
                let options: AggregateOptions = decode_options(options)?;
                let docs: Vec<Document> = collection
                    .aggregate(pipeline)
                    .with_options(options)
                    .await
                    .map_err(err)?
                    .try_collect()
                    .await
                    .map_err(err)?;
                documents_outcome(docs)
            }
            MongoOperation::Count { filter, options } => {
                let options: CountOptions = decode_options(options)?;
                let count = collection
                    .count_documents(filter.unwrap_or_default())
                    .with_options(options)
                    .await
                    .map_err(err)?;
                QueryOutcome::write(WriteSummary {
                    count: Some(count),
                    ..WriteSummary::default()
                })
            }
            MongoOperation::Distinct { field, filter } => {
                let values = collection
                    .distinct(field.as_str(), filter.unwrap_or_default())
                    .await
                    .map_err(err)?;
                QueryOutcome::rows(values.into_iter().map(to_json).collect(), vec![field])
            }
        };
        Ok(outcome)
    }
}

fn update_outcome(matched: u64, modified: u64, upserted: Option<Bson>) -> QueryOutcome {
    QueryOutcome::write(WriteSummary {
        matched_count: Some(matched),
        modified_count: Some(modified),
        upserted_id: upserted.map(to_json),
        ..WriteSummary::affected(modified)
    })
}

fn delete_outcome(deleted: u64) -> QueryOutcome {
    QueryOutcome::write(WriteSummary {
        deleted_count: Some(deleted),
        ..WriteSummary::affected(deleted)
    })
}

#[async_trait]
impl Connector for MongoConnector {
    fn db_type(&self) -> DbType {
        DbType::MongoDB
    }

    async fn connect(&self, args: &ConnectArgs) -> AppResult<ConnectionHandle> {
        let defaults = DialectDefaults::from_env(DbType::MongoDB);
        let url = resolve_url(DbType::MongoDB, args, &defaults)?;
        let mut options = ClientOptions::parse(url.as_str())
            .await
            .map_err(|e| connection_error(DbType::MongoDB, e))?;
        options.connect_timeout = Some(self.settings.connect_timeout);
        options.server_selection_timeout = Some(self.settings.connect_timeout);

        let database = args
            .option_str("database")
            .or_else(|| args.database.clone())
            .or_else(|| options.default_database.clone())
            .or(defaults.database)
            .unwrap_or_else(|| "test".to_string());

        let client =
            Client::with_options(options).map_err(|e| connection_error(DbType::MongoDB, e))?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| connection_error(DbType::MongoDB, e))?;

        Ok(ConnectionHandle::Mongo(MongoHandle {
            client,
            database,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn list_databases(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        let handle = mongo_handle(handle)?;
        handle.database()?;
        handle.client.list_database_names().await.map_err(err)
    }

    async fn list_tables(&self, handle: &ConnectionHandle) -> AppResult<Vec<String>> {
        let mut names = mongo_handle(handle)?
            .database()?
            .list_collection_names()
            .await
            .map_err(err)?;
        names.sort();
        Ok(names)
    }

    async fn get_table_structure(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
    ) -> AppResult<TableStructure> {
        let collection = mongo_handle(handle)?.collection(table_name)?;

        let sample: Vec<Document> = collection
            .find(doc! {})
            .limit(SAMPLE_SIZE)
            .await
            .map_err(err)?
            .try_collect()
            .await
            .map_err(err)?;

        let models: Vec<mongodb::IndexModel> = collection
            .list_indexes()
            .await
            .map_err(err)?
            .try_collect()
            .await
            .map_err(err)?;
        let indexes = models
            .into_iter()
            .map(|model| {
                let name = model
                    .options
                    .as_ref()
                    .and_then(|o| o.name.clone())
                    .unwrap_or_default();
                let primary = name == ID_INDEX;
                let unique = primary
                    || model
                        .options
                        .as_ref()
                        .and_then(|o| o.unique)
                        .unwrap_or(false);
                IndexInfo {
                    columns: model.keys.keys().cloned().collect(),
                    kind: IndexKind::classify(primary, unique),
                    unique,
                    name,
                }
            })
            .collect();

        Ok(TableStructure {
            table_name: table_name.to_string(),
            columns: infer_columns(&sample),
            indexes,
        })
    }

    async fn execute_query(
        &self,
        handle: &ConnectionHandle,
        query: &str,
        _params: &[Value],
    ) -> AppResult<QueryOutcome> {
        let MongoQuery {
            collection,
            operation,
        } = parse_query(query)?;
        tracing::debug!(collection = %collection, operation = ?operation, "mongodb execute");
        let collection = mongo_handle(handle)?.collection(&collection)?;
        self.run(collection, operation).await
    }

    async fn insert_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        rows: &InsertRows,
    ) -> AppResult<QueryOutcome> {
        let collection = mongo_handle(handle)?.collection(table_name)?;
        let documents = rows
            .records()
            .iter()
            .map(record_to_document)
            .collect::<AppResult<Vec<_>>>()?;
        let operation = if rows.is_single() {
            let document = documents.into_iter().next().unwrap_or_default();
            MongoOperation::InsertOne { document }
        } else {
            MongoOperation::InsertMany { documents }
        };
        self.run(collection, operation).await
    }

    async fn update_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        data: &Record,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let collection = mongo_handle(handle)?.collection(table_name)?;
        let operation = MongoOperation::UpdateMany {
            filter: Some(record_to_document(filter)?),
            update: UpdateModifications::Document(doc! { "$set": record_to_document(data)? }),
            upsert: false,
        };
        self.run(collection, operation).await
    }

    async fn delete_data(
        &self,
        handle: &ConnectionHandle,
        table_name: &str,
        filter: &Record,
    ) -> AppResult<QueryOutcome> {
        let collection = mongo_handle(handle)?.collection(table_name)?;
        let operation = MongoOperation::DeleteMany {
            filter: Some(record_to_document(filter)?),
        };
        self.run(collection, operation).await
    }

    async fn close_connection(&self, handle: &ConnectionHandle) -> AppResult<()> {
        let handle = mongo_handle(handle)?;
        if handle.closed.swap(true, Ordering::SeqCst) {
            return Err(connection_error(DbType::MongoDB, "connection is already closed"));
        }
        handle.client.clone().shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;

    fn parse(value: Value) -> AppResult<MongoQuery> {
        parse_query(&value.to_string())
    }

    #[test]
    fn test_unknown_action_is_unsupported() {
        let err = parse(json!({"collection": "c", "action": "bogus"})).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_OPERATION");
    }

    #[test]
    fn test_missing_collection_or_bad_json_is_malformed() {
        assert_eq!(
            parse(json!({"action": "find"})).unwrap_err().code(),
            "MALFORMED_QUERY"
        );
        assert_eq!(
            parse(json!({"collection": "", "action": "find"})).unwrap_err().code(),
            "MALFORMED_QUERY"
        );
        assert_eq!(parse_query("{not json").unwrap_err().code(), "MALFORMED_QUERY");
    }

    #[test]
    fn test_missing_variant_field_is_malformed() {
        let err = parse(json!({"collection": "c", "action": "insertOne"})).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_QUERY");
        let err = parse(json!({"collection": "c", "action": "insertMany", "documents": []}))
            .unwrap_err();
        assert_eq!(err.code(), "MALFORMED_QUERY");
    }

    #[test]
    fn test_find_decodes_extended_json() {
        let oid = "65a1b2c3d4e5f60718293a4b";
        let query = parse(json!({
            "collection": "users",
            "action": "find",
            "filter": {"_id": {"$oid": oid}},
            "sort": {"age": -1},
            "limit": 5
        }))
        .unwrap();
        assert_eq!(query.collection, "users");
        match query.operation {
            MongoOperation::Find {
                filter,
                sort,
                limit,
                skip,
                ..
            } => {
                let expected = ObjectId::parse_str(oid).unwrap();
                assert_eq!(filter, Some(doc! {"_id": expected}));
                assert_eq!(sort, Some(doc! {"age": -1}));
                assert_eq!(limit, Some(5));
                assert_eq!(skip, None);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_update_accepts_pipeline() {
        let query = parse(json!({
            "collection": "c",
            "action": "updateMany",
            "update": [{"$set": {"total": {"$add": ["$a", "$b"]}}}]
        }))
        .unwrap();
        match query.operation {
            MongoOperation::UpdateMany { update, upsert, .. } => {
                assert!(matches!(update, UpdateModifications::Pipeline(ref stages) if stages.len() == 1));
                assert!(!upsert);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_options_decode_into_driver_types() {
        let options: FindOptions = decode_options(Some(doc! {"limit": 3_i64})).unwrap();
        assert_eq!(options.limit, Some(3));
        let options: CountOptions = decode_options(None).unwrap();
        assert!(options.limit.is_none());
    }

    #[test]
    fn test_infer_columns_marks_mixed_and_missing_fields() {
        let docs = vec![
            doc! {"_id": 1, "name": "a", "age": 30, "tags": ["x"]},
            doc! {"_id": 2, "name": "b", "age": "unknown"},
            doc! {"_id": 3, "name": "c", "age": 40, "note": Bson::Null},
        ];
        let columns = infer_columns(&docs);
        let names: Vec<_> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["name", "age", "tags", "note"]);

        assert_eq!(columns[0].data_type, "string");
        assert!(!columns[0].nullable);
        assert_eq!(columns[1].data_type, "mixed");
        assert_eq!(columns[2].data_type, "array");
        assert!(columns[2].nullable);
        assert_eq!(columns[3].data_type, "null");
        assert!(columns[3].nullable);
    }

    #[test]
    fn test_infer_columns_on_empty_sample() {
        assert!(infer_columns(&[]).is_empty());
    }

    #[test]
    fn test_union_keys_keeps_first_seen_order() {
        let docs = vec![doc! {"a": 1, "b": 2}, doc! {"c": 3, "a": 4}];
        assert_eq!(union_keys(&docs), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_documents_render_as_relaxed_extjson() {
        let value = document_to_json(doc! {"n": 5_i64, "ok": true});
        assert_eq!(value, json!({"n": 5, "ok": true}));
    }
}
