//! Items shown in choice sets: features and cash vouchers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A qualitative item with a material cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Material cost / monetary baseline, in currency units.
    #[serde(default)]
    pub cost: f64,
}

impl Feature {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cost: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            cost,
        }
    }
}

/// A monetary anchor item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub id: String,
    /// Currency amount, always >= 0.
    pub amount: f64,
    /// Index of this amount in the voucher grid.
    pub level: usize,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Feature,
    Voucher,
}

/// Immutable lookup over the features and vouchers of one design run.
///
/// Ids are assumed disjoint across kinds; on a duplicate id the first
/// registration wins.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    features: Vec<Feature>,
    vouchers: Vec<Voucher>,
    index: HashMap<String, (ItemKind, usize)>,
}

impl ItemCatalog {
    pub fn new(features: Vec<Feature>, vouchers: Vec<Voucher>) -> Self {
        let mut index = HashMap::with_capacity(features.len() + vouchers.len());
        for (pos, f) in features.iter().enumerate() {
            index
                .entry(f.id.clone())
                .or_insert((ItemKind::Feature, pos));
        }
        for (pos, v) in vouchers.iter().enumerate() {
            index
                .entry(v.id.clone())
                .or_insert((ItemKind::Voucher, pos));
        }
        Self {
            features,
            vouchers,
            index,
        }
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn vouchers(&self) -> &[Voucher] {
        &self.vouchers
    }

    pub fn kind(&self, id: &str) -> Option<ItemKind> {
        self.index.get(id).map(|(kind, _)| *kind)
    }

    pub fn feature(&self, id: &str) -> Option<&Feature> {
        match self.index.get(id) {
            Some((ItemKind::Feature, pos)) => self.features.get(*pos),
            _ => None,
        }
    }

    pub fn voucher(&self, id: &str) -> Option<&Voucher> {
        match self.index.get(id) {
            Some((ItemKind::Voucher, pos)) => self.vouchers.get(*pos),
            _ => None,
        }
    }

    pub fn feature_ids(&self) -> Vec<String> {
        self.features.iter().map(|f| f.id.clone()).collect()
    }

    pub fn voucher_ids(&self) -> Vec<String> {
        self.vouchers.iter().map(|v| v.id.clone()).collect()
    }

    pub fn max_voucher_amount(&self) -> f64 {
        self.vouchers
            .iter()
            .map(|v| v.amount)
            .fold(0.0, f64::max)
    }

    pub fn mean_feature_cost(&self) -> f64 {
        if self.features.is_empty() {
            return 0.0;
        }
        self.features.iter().map(|f| f.cost).sum::<f64>() / self.features.len() as f64
    }
}
