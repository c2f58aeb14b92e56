// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Dense group-id assignment for distinct grouping-key tuples.
//!
//! Responsibilities:
//! - Maps each distinct key tuple to a small dense integer id in
//!   first-seen order, growing dynamically as new tuples arrive.
//! - Materializes the unique key tuples back into columns for aggregate
//!   output assembly and cross-slot merge transpositions.
//!
//! Key exported interfaces:
//! - Types: `Grouper`.

use arrow::array::ArrayRef;
use arrow::datatypes::DataType;
use arrow::row::{OwnedRow, RowConverter, SortField};
use hashbrown::HashMap;

use crate::common::error::{EngineError, Result};

/// Per-thread-slot structure assigning dense integer ids to distinct
/// grouping-key tuples.
///
/// Exclusively owned by its slot until the merge phase; the merge feeds
/// another grouper's unique keys through `consume` to obtain the
/// old-id → shared-id transposition.
#[derive(Debug)]
pub struct Grouper {
    converter: RowConverter,
    ids: HashMap<OwnedRow, u32>,
    // Unique key rows, index == assigned group id.
    ordered: Vec<OwnedRow>,
}

impl Grouper {
    pub fn new(key_types: &[DataType]) -> Result<Self> {
        if key_types.is_empty() {
            return Err(EngineError::invalid_argument(
                "grouper requires at least one key column",
            ));
        }
        let fields = key_types
            .iter()
            .map(|dt| SortField::new(dt.clone()))
            .collect();
        Ok(Self {
            converter: RowConverter::new(fields)?,
            ids: HashMap::new(),
            ordered: Vec::new(),
        })
    }

    /// Assign a group id to every row of the key columns, creating ids
    /// for unseen tuples in first-seen order.
    pub fn consume(&mut self, key_columns: &[ArrayRef]) -> Result<Vec<u32>> {
        let rows = self.converter.convert_columns(key_columns)?;
        let mut out = Vec::with_capacity(rows.num_rows());
        for row in rows.iter() {
            let next_id = self.ordered.len() as u32;
            let id = match self.ids.get(&row.owned()) {
                Some(id) => *id,
                None => {
                    let owned = row.owned();
                    self.ids.insert(owned.clone(), next_id);
                    self.ordered.push(owned);
                    next_id
                }
            };
            out.push(id);
        }
        Ok(out)
    }

    /// Look up the group id of every row without assigning new ids;
    /// unseen tuples map to `None`. Used by probe-side join lookups.
    pub fn probe(&self, key_columns: &[ArrayRef]) -> Result<Vec<Option<u32>>> {
        let rows = self.converter.convert_columns(key_columns)?;
        Ok(rows
            .iter()
            .map(|row| self.ids.get(&row.owned()).copied())
            .collect())
    }

    pub fn num_groups(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Materialize the unique key tuples as columns, ordered by group
    /// id.
    pub fn key_columns(&self) -> Result<Vec<ArrayRef>> {
        let columns = self
            .converter
            .convert_rows(self.ordered.iter().map(|owned| owned.row()))?;
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use std::sync::Arc;

    #[test]
    fn ids_assigned_in_first_seen_order() {
        let mut grouper = Grouper::new(&[DataType::Utf8]).expect("grouper");
        let keys: ArrayRef = Arc::new(StringArray::from(vec!["a", "b", "a", "c", "b"]));
        let ids = grouper.consume(&[keys]).expect("consume");
        assert_eq!(ids, vec![0, 1, 0, 2, 1]);
        assert_eq!(grouper.num_groups(), 3);
    }

    #[test]
    fn key_columns_round_trip() {
        let mut grouper = Grouper::new(&[DataType::Int64]).expect("grouper");
        let keys: ArrayRef = Arc::new(Int64Array::from(vec![7, 7, 9]));
        grouper.consume(&[keys]).expect("consume");
        let columns = grouper.key_columns().expect("keys");
        let column = columns[0]
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64");
        assert_eq!(column.values(), &[7, 9]);
    }

    #[test]
    fn transposition_via_foreign_keys() {
        let mut left = Grouper::new(&[DataType::Int64]).expect("grouper");
        let mut right = Grouper::new(&[DataType::Int64]).expect("grouper");
        let left_keys: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));
        let right_keys: ArrayRef = Arc::new(Int64Array::from(vec![2, 3]));
        left.consume(&[left_keys]).expect("consume");
        right.consume(&[right_keys]).expect("consume");
        // Feed right's unique keys through left: 2 is shared, 3 is new.
        let transposition = left
            .consume(&right.key_columns().expect("keys"))
            .expect("consume");
        assert_eq!(transposition, vec![1, 2]);
        assert_eq!(left.num_groups(), 3);
    }

    #[test]
    fn probe_never_assigns_new_ids() {
        let mut grouper = Grouper::new(&[DataType::Int64]).expect("grouper");
        let keys: ArrayRef = Arc::new(Int64Array::from(vec![1, 2]));
        grouper.consume(&[keys]).expect("consume");
        let probe_keys: ArrayRef = Arc::new(Int64Array::from(vec![2, 5]));
        let hits = grouper.probe(&[probe_keys]).expect("probe");
        assert_eq!(hits, vec![Some(1), None]);
        assert_eq!(grouper.num_groups(), 2);
    }

    #[test]
    fn empty_key_list_is_invalid() {
        let err = Grouper::new(&[]).expect_err("must fail");
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
