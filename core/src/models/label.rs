use rusqlite::types::Value;

use crate::error::StoreError;
use crate::store::record::{self, Record, RowReader};


#[derive(Debug, Clone, PartialEq)]
pub struct AtomicGroup {
    pub id: i64,
    pub name: String,
    pub max_number_of_machines: i64,
    pub invalid: bool,
}

impl Record for AtomicGroup {
    const TABLE: &'static str = "atomic_groups";
    const FIELDS: &'static [&'static str] = &["id", "name", "max_number_of_machines", "invalid"];

    fn id(&self) -> i64 {
        self.id
    }

    fn from_values(values: &[Value]) -> Result<Self, StoreError> {
        let row = RowReader::new::<Self>(values)?;
        Ok(AtomicGroup {
            id: row.int(0)?,
            name: row.text(1)?,
            max_number_of_machines: row.int(2)?,
            invalid: row.flag(3)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            record::text(&self.name),
            Value::Integer(self.max_number_of_machines),
            record::flag(self.invalid),
        ]
    }
}

impl AtomicGroup {
    pub fn new(name: &str, max_number_of_machines: i64) -> AtomicGroup {
        AtomicGroup {
            id: 0,
            name: name.to_string(),
            max_number_of_machines,
            invalid: false,
        }
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub id: i64,
    pub name: String,
    pub atomic_group_id: Option<i64>,
    /// Hosts carrying this label only take jobs that ask for it.
    pub only_if_needed: bool,
    pub invalid: bool,
    pub platform: bool,
}

impl Record for Label {
    const TABLE: &'static str = "labels";
    const FIELDS: &'static [&'static str] = &[
        "id",
        "name",
        "atomic_group_id",
        "only_if_needed",
        "invalid",
        "platform",
    ];

    fn id(&self) -> i64 {
        self.id
    }

    fn from_values(values: &[Value]) -> Result<Self, StoreError> {
        let row = RowReader::new::<Self>(values)?;
        Ok(Label {
            id: row.int(0)?,
            name: row.text(1)?,
            atomic_group_id: row.opt_int(2)?,
            only_if_needed: row.flag(3)?,
            invalid: row.flag(4)?,
            platform: row.flag(5)?,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            Value::Integer(self.id),
            record::text(&self.name),
            record::opt_int(self.atomic_group_id),
            record::flag(self.only_if_needed),
            record::flag(self.invalid),
            record::flag(self.platform),
        ]
    }
}

impl Label {
    pub fn new(name: &str) -> Label {
        Label {
            id: 0,
            name: name.to_string(),
            atomic_group_id: None,
            only_if_needed: false,
            invalid: false,
            platform: false,
        }
    }
}
