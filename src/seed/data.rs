use anyhow::{Context, Result};

use crate::logic::EavService;
use crate::model::{AttributeInput, Datatype};
use crate::store::traits::Store;

/// Helper function to declare one attribute of the demo catalog
fn attribute(name: &str, datatype: Datatype, choices: &[&str]) -> AttributeInput {
    AttributeInput {
        name: name.to_string(),
        slug: None,
        datatype: Some(datatype),
        choices: choices.iter().map(|c| c.to_string()).collect(),
    }
}

fn catalog() -> Vec<AttributeInput> {
    vec![
        attribute("Color", Datatype::Enum, &["red", "green", "blue", "black"]),
        attribute("Size", Datatype::Enum, &["small", "medium", "large"]),
        attribute("Weight", Datatype::Float, &[]),
        attribute("Quantity", Datatype::Int, &[]),
        attribute("In Stock", Datatype::Bool, &[]),
        attribute("Released", Datatype::Date, &[]),
        attribute("Notes", Datatype::Text, &[]),
    ]
}

/// Declare the demo attribute catalog. Safe to run on every start: existing
/// attributes are kept and missing choices are added.
pub async fn load_seed_data<S: Store>(service: &EavService<S>) -> Result<()> {
    for input in catalog() {
        let name = input.name.clone();
        let (view, created) = service
            .create_attribute(input)
            .await
            .with_context(|| format!("seeding attribute '{}'", name))?;
        log::info!(
            "Seed attribute '{}' ({}): {}",
            view.attribute.slug,
            view.attribute.datatype,
            if created { "created" } else { "already present" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EavRegistry;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn seeding_twice_yields_one_catalog() {
        let service = EavService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EavRegistry::default()),
            3,
        );
        load_seed_data(&service).await.unwrap();
        load_seed_data(&service).await.unwrap();

        let attributes = service.list_attributes().await.unwrap();
        let slugs: Vec<&str> = attributes.iter().map(|a| a.attribute.slug.as_str()).collect();
        assert_eq!(
            slugs,
            vec!["color", "size", "weight", "quantity", "in_stock", "released", "notes"]
        );
        let color = &attributes[0];
        assert_eq!(color.choices, vec!["red", "green", "blue", "black"]);
        assert!(attributes.iter().all(|a| a.attribute.is_consistent()));
        assert_eq!(service.list_enum_groups().await.unwrap().len(), 2);
    }
}
