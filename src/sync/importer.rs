use mongodb::bson::oid::ObjectId;
use std::sync::Arc;

use crate::mapping::FieldMapper;
use crate::models::*;
use crate::processing::ImageSideloader;
use crate::storage::ContentStore;
use crate::sync::DedupChecker;

/// Imports one mapped CSV row. Errors stop at the row boundary and come back
/// as [`RowOutcome::Failed`].
#[derive(Clone)]
pub struct RowImporter {
    mapper: FieldMapper,
    content: Arc<dyn ContentStore>,
    dedup: DedupChecker,
    sideloader: ImageSideloader,
}

impl RowImporter {
    pub fn new(mapper: FieldMapper, content: Arc<dyn ContentStore>, sideloader: ImageSideloader) -> Self {
        let dedup = DedupChecker::new(content.clone());
        Self { mapper, content, dedup, sideloader }
    }

    pub async fn import(&self, mapping: &FrozenMapping, headers: &[String], row: &[String]) -> RowOutcome {
        match self.try_import(mapping, headers, row).await {
            Ok(outcome) => outcome,
            Err(e) => RowOutcome::Failed(e),
        }
    }

    async fn try_import(&self, mapping: &FrozenMapping, headers: &[String], row: &[String]) -> Result<RowOutcome> {
        let record = self.mapper.map_row(mapping, headers, row)?;

        if mapping.skip_duplicates {
            if let Some(existing) = self.dedup.find_existing(&record.post).await? {
                return Ok(RowOutcome::Skipped(existing));
            }
        }

        let entry = self.content.insert(&record.post).await?;

        for field in &record.custom_fields {
            self.content.set_custom_field(entry, &field.key, &field.value).await?;
        }
        if let Some(additional) = &record.additional_images {
            self.content.set_additional_images_ref(entry, additional).await?;
        }

        // The post stays in place if the image fails; the row still counts as failed
        if let Some(url) = &record.image_url {
            let attachment = self.sideload(entry, url, record.image_alt.as_deref()).await?;
            self.content.set_primary_image(entry, attachment).await?;
        }

        Ok(RowOutcome::Imported(entry))
    }

    async fn sideload(&self, entry: ObjectId, url: &str, alt: Option<&str>) -> Result<ObjectId> {
        self.sideloader.sideload(url, entry, alt).await.map_err(|e| {
            tracing::warn!(post_id = %entry, url = %url, error = %e, "Featured image failed after post insert");
            e
        })
    }
}
