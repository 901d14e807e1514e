use std::collections::{BTreeMap, HashMap};

use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::operation::transact_write_items::TransactWriteItemsError;
use aws_sdk_dynamodb::types::{AttributeValue, Put, TransactWriteItem};
use uuid::Uuid;

use super::models::{AiResult, LeafAnalysisImage, NewAiResult, Top3Prediction};
use super::{RepositoryError, ResultRepository};

const RESULT_SK: &str = "RESULT";
const PREDICTION_PREFIX: &str = "PREDICTION#";
const IMAGE_PREFIX: &str = "IMAGE#";

type Item = HashMap<String, AttributeValue>;

/// Results live in one table: every result item and its children share the
/// partition key of the (application id, user id) pair.
#[derive(Clone)]
pub struct DynamoDbRepository {
    client: Client,
    results_table: String,
}

pub fn partition_key(application_id: &str, user_id: &str) -> String {
    format!("APP#{}#USER#{}", application_id, user_id)
}

fn string_attr(item: &mut Item, name: &str, value: &str) {
    item.insert(name.to_string(), AttributeValue::S(value.to_string()));
}

fn number_attr(item: &mut Item, name: &str, value: impl ToString) {
    item.insert(name.to_string(), AttributeValue::N(value.to_string()));
}

fn get_string(item: &Item, name: &str) -> Result<String, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

fn get_number<T: std::str::FromStr>(item: &Item, name: &str) -> Result<T, RepositoryError> {
    item.get(name)
        .and_then(|v| v.as_n().ok())
        .and_then(|s| s.parse::<T>().ok())
        .ok_or_else(|| RepositoryError::InvalidData(format!("Invalid {}", name)))
}

impl DynamoDbRepository {
    pub fn new(client: Client, results_table: String) -> Self {
        Self {
            client,
            results_table,
        }
    }

    fn result_item(id: &str, pk: &str, result: &NewAiResult) -> Item {
        let mut item = HashMap::new();
        string_attr(&mut item, "pk", pk);
        string_attr(&mut item, "sk", RESULT_SK);
        string_attr(&mut item, "id", id);
        string_attr(&mut item, "applicationId", &result.application_id);
        string_attr(&mut item, "userId", &result.user_id);
        string_attr(&mut item, "result", &result.result);
        string_attr(&mut item, "prediction", &result.prediction);
        string_attr(&mut item, "accuracy", &result.accuracy);
        number_attr(&mut item, "confidence", result.confidence);
        number_attr(&mut item, "severity", result.severity);
        number_attr(&mut item, "lesion_area", result.lesion_area);
        number_attr(&mut item, "leaf_area", result.leaf_area);
        if let Some(image_path) = &result.image_path {
            string_attr(&mut item, "image_path", image_path);
        }
        item
    }

    fn prediction_item(pk: &str, result_id: &str, prediction: &Top3Prediction) -> Item {
        let mut item = HashMap::new();
        string_attr(&mut item, "pk", pk);
        string_attr(&mut item, "sk", &format!("{}{}", PREDICTION_PREFIX, prediction.rank));
        string_attr(&mut item, "ai_result_id", result_id);
        string_attr(&mut item, "class_name", &prediction.class_name);
        number_attr(&mut item, "confidence", prediction.confidence);
        number_attr(&mut item, "rank", prediction.rank);
        item
    }

    fn image_item(pk: &str, result_id: &str, index: usize, image: &LeafAnalysisImage) -> Item {
        let mut item = HashMap::new();
        string_attr(&mut item, "pk", pk);
        string_attr(&mut item, "sk", &format!("{}{:02}", IMAGE_PREFIX, index));
        string_attr(&mut item, "ai_result_id", result_id);
        string_attr(&mut item, "image_type", &image.image_type);
        string_attr(&mut item, "image_path", &image.image_path);
        number_attr(&mut item, "width", image.width);
        number_attr(&mut item, "height", image.height);
        number_attr(&mut item, "file_size", image.file_size);
        string_attr(&mut item, "created_at", &image.created_at);
        item
    }

    fn put(&self, item: Item, guard: bool) -> Result<TransactWriteItem, RepositoryError> {
        let mut put = Put::builder()
            .table_name(&self.results_table)
            .set_item(Some(item));
        if guard {
            put = put.condition_expression("attribute_not_exists(pk)");
        }
        let put = put
            .build()
            .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;
        Ok(TransactWriteItem::builder().put(put).build())
    }

    /// Every item matching `filter`, following scan pagination.
    async fn scan_all(
        &self,
        filter: &str,
        values: Vec<(&str, String)>,
    ) -> Result<Vec<Item>, RepositoryError> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let mut request = self
                .client
                .scan()
                .table_name(&self.results_table)
                .filter_expression(filter)
                .set_exclusive_start_key(start_key);
            for (name, value) in &values {
                request = request.expression_attribute_values(*name, AttributeValue::S(value.clone()));
            }
            let response = request
                .send()
                .await
                .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

            items.extend(response.items.unwrap_or_default());
            match response.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn partition(&self, pk: &str) -> Result<Vec<Item>, RepositoryError> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let response = self
                .client
                .query()
                .table_name(&self.results_table)
                .key_condition_expression("pk = :pk")
                .expression_attribute_values(":pk", AttributeValue::S(pk.to_string()))
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| RepositoryError::DynamoDb(e.to_string()))?;

            items.extend(response.items.unwrap_or_default());
            match response.last_evaluated_key {
                Some(key) if !key.is_empty() => start_key = Some(key),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Loads the full result whose result item matched a scan.
    async fn load(&self, result_item: &Item) -> Result<AiResult, RepositoryError> {
        let pk = get_string(result_item, "pk")?;
        let items = self.partition(&pk).await?;
        let mut results = assemble_results(items)?;
        results.pop().ok_or(RepositoryError::NotFound)
    }
}

fn parse_result_item(item: &Item) -> Result<AiResult, RepositoryError> {
    Ok(AiResult {
        id: get_string(item, "id")?,
        application_id: get_string(item, "applicationId")?,
        user_id: get_string(item, "userId")?,
        result: get_string(item, "result")?,
        prediction: get_string(item, "prediction")?,
        accuracy: get_string(item, "accuracy")?,
        confidence: get_number(item, "confidence")?,
        severity: get_number(item, "severity")?,
        lesion_area: get_number(item, "lesion_area")?,
        leaf_area: get_number(item, "leaf_area")?,
        image_path: item.get("image_path").and_then(|v| v.as_s().ok()).cloned(),
        top3_predictions: Vec::new(),
        leaf_analysis_images: Vec::new(),
    })
}

fn parse_prediction_item(item: &Item) -> Result<Top3Prediction, RepositoryError> {
    Ok(Top3Prediction {
        class_name: get_string(item, "class_name")?,
        confidence: get_number(item, "confidence")?,
        rank: get_number(item, "rank")?,
    })
}

fn parse_image_item(item: &Item) -> Result<LeafAnalysisImage, RepositoryError> {
    Ok(LeafAnalysisImage {
        image_type: get_string(item, "image_type")?,
        image_path: get_string(item, "image_path")?,
        width: get_number(item, "width")?,
        height: get_number(item, "height")?,
        file_size: get_number(item, "file_size")?,
        created_at: get_string(item, "created_at")?,
    })
}

/// Groups items by partition into results with their children attached.
/// Children are ordered by sort key: predictions by rank, images by index.
fn assemble_results(items: Vec<Item>) -> Result<Vec<AiResult>, RepositoryError> {
    let mut partitions: BTreeMap<String, Vec<(String, Item)>> = BTreeMap::new();
    for item in items {
        let pk = get_string(&item, "pk")?;
        let sk = get_string(&item, "sk")?;
        partitions.entry(pk).or_default().push((sk, item));
    }

    let mut results = Vec::with_capacity(partitions.len());
    for (_, mut entries) in partitions {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let Some(position) = entries.iter().position(|(sk, _)| sk == RESULT_SK) else {
            continue;
        };
        let mut result = parse_result_item(&entries[position].1)?;
        for (sk, item) in &entries {
            if sk.starts_with(PREDICTION_PREFIX) {
                result.top3_predictions.push(parse_prediction_item(item)?);
            } else if sk.starts_with(IMAGE_PREFIX) {
                result.leaf_analysis_images.push(parse_image_item(item)?);
            }
        }
        results.push(result);
    }
    Ok(results)
}

impl ResultRepository for DynamoDbRepository {
    async fn insert_with_children(&self, result: &NewAiResult) -> Result<AiResult, RepositoryError> {
        let id = Uuid::new_v4().to_string();
        let pk = partition_key(&result.application_id, &result.user_id);

        let mut writes = vec![self.put(Self::result_item(&id, &pk, result), true)?];
        for prediction in &result.top3_predictions {
            writes.push(self.put(Self::prediction_item(&pk, &id, prediction), false)?);
        }
        for (index, image) in result.leaf_analysis_images.iter().enumerate() {
            writes.push(self.put(Self::image_item(&pk, &id, index, image), false)?);
        }

        match self
            .client
            .transact_write_items()
            .set_transact_items(Some(writes))
            .send()
            .await
        {
            Ok(_) => {
                log::info!(
                    "Stored result {} for application {} ({})",
                    id,
                    result.application_id,
                    result.result
                );
                Ok(result.clone().into_stored(id))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                let duplicate = match &service_error {
                    TransactWriteItemsError::TransactionCanceledException(cancelled) => cancelled
                        .cancellation_reasons()
                        .iter()
                        .any(|reason| reason.code() == Some("ConditionalCheckFailed")),
                    _ => false,
                };
                if duplicate {
                    return Err(RepositoryError::Duplicate {
                        application_id: result.application_id.clone(),
                        user_id: result.user_id.clone(),
                    });
                }
                log::error!(
                    "DynamoDB transaction failed for application {}: {:?}",
                    result.application_id,
                    service_error
                );
                Err(RepositoryError::DynamoDb(service_error.to_string()))
            }
        }
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<AiResult>, RepositoryError> {
        let items = self
            .scan_all(
                "sk = :sk AND id = :id",
                vec![(":sk", RESULT_SK.to_string()), (":id", id.to_string())],
            )
            .await?;
        match items.first() {
            Some(item) => Ok(Some(self.load(item).await?)),
            None => Ok(None),
        }
    }

    async fn get_by_application_id(
        &self,
        application_id: &str,
    ) -> Result<Option<AiResult>, RepositoryError> {
        let items = self
            .scan_all(
                "sk = :sk AND applicationId = :app",
                vec![
                    (":sk", RESULT_SK.to_string()),
                    (":app", application_id.to_string()),
                ],
            )
            .await?;
        match items.first() {
            Some(item) => Ok(Some(self.load(item).await?)),
            None => Ok(None),
        }
    }

    async fn list_results(&self, application_id: Option<&str>) -> Result<Vec<AiResult>, RepositoryError> {
        let items = match application_id {
            Some(application_id) => {
                let prefix = format!("APP#{}#USER#", application_id);
                self.scan_all("begins_with(pk, :prefix)", vec![(":prefix", prefix)])
                    .await?
            }
            None => self.scan_all("attribute_exists(pk)", Vec::new()).await?,
        };
        assemble_results(items)
    }
}
