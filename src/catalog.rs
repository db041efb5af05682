//! Read-only product reference data.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Temperature correction path for a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CorrectionSource {
    /// ASTM 54B volume correction factor
    Astm54b,
    /// Registered [`CorrectionTable`](crate::correction::CorrectionTable)
    Table { id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Density at 15 °C in vacuum (kg/m³)
    pub density_15c_vacuum: f64,
    #[serde(default)]
    pub supports_temperature_correction: bool,
    #[serde(default)]
    pub correction: Option<CorrectionSource>,
}

impl Product {
    /// The correction path to apply, if the product opts in and names one
    pub fn correction_source(&self) -> Option<&CorrectionSource> {
        if self.supports_temperature_correction {
            self.correction.as_ref()
        } else {
            None
        }
    }
}

/// External product/density catalog
pub trait ProductCatalog: Send + Sync {
    fn lookup(&self, product_id: &str) -> Option<Product>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    products: HashMap<String, Product>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, product: Product) {
        self.products.insert(product.id.clone(), product);
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

impl FromIterator<Product> for InMemoryCatalog {
    fn from_iter<I: IntoIterator<Item = Product>>(iter: I) -> Self {
        let mut catalog = Self::new();
        for product in iter {
            catalog.insert(product);
        }
        catalog
    }
}

impl ProductCatalog for InMemoryCatalog {
    fn lookup(&self, product_id: &str) -> Option<Product> {
        self.products.get(product_id).cloned()
    }
}
