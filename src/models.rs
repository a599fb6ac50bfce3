use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub photo: Option<String>,
    pub currency: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TransactionType {
    pub id: i64,
    pub code: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Category {
    pub id: i64,
    pub type_id: i64,
    pub name: String,
    pub manual_budget: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Subcategory {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
    pub icon: Option<String>,
    pub manual_budget: Option<f64>,
}

/// A transaction joined with its type, category and invoices, as listed to
/// the client.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub date: String,
    pub amount: f64,
    pub amount_eur: Option<f64>,
    pub currency: String,
    pub notes: Option<String>,
    pub type_id: Option<i64>,
    pub type_code: String,
    pub category_id: Option<i64>,
    pub category: Option<String>,
    pub subcategory_id: Option<i64>,
    pub subcategory: Option<String>,
    pub icon: Option<String>,
    pub goal_id: Option<i64>,
    pub recurring_plan_id: Option<i64>,
    /// Invoice file paths joined with `||`.
    pub invoices: Option<String>,
}

/// Transaction type ids fixed by the seed data.
pub const TYPE_EXPENSE: i64 = 1;
pub const TYPE_INCOME: i64 = 2;
pub const TYPE_EPARGNE: i64 = 3;

/// Result of a delete that may be blocked by dependent rows.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted { reassigned: BTreeMap<&'static str, usize> },
    ContainsRelated(BTreeMap<&'static str, i64>),
}
