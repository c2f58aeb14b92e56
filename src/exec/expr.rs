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
//! Scalar expressions evaluated over batches.
//!
//! Responsibilities:
//! - Defines the closed expression tree used by filter predicates and
//!   projections, evaluated column-at-a-time through arrow compute
//!   kernels.
//! - Resolves expression output types against an input schema for
//!   projection schema inference.
//!
//! Key exported interfaces:
//! - Types: `Expr`, `ScalarValue`.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, Scalar, StringArray,
};
use arrow::compute::kernels::cmp;
use arrow::compute::kernels::numeric;
use arrow::compute::{and, is_not_null, is_null, not, or};
use arrow::datatypes::{DataType, SchemaRef};

use crate::common::error::{EngineError, Result};
use crate::exec::batch::Batch;

/// A single typed scalar, used for literals and scalar-aggregate
/// results.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Int64(Option<i64>),
    Float64(Option<f64>),
    Boolean(Option<bool>),
    Utf8(Option<String>),
}

impl ScalarValue {
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Utf8(_) => DataType::Utf8,
        }
    }

    /// Materialize as an array repeating this value `len` times.
    pub fn to_array(&self, len: usize) -> ArrayRef {
        match self {
            ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; len])),
            ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; len])),
            ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; len])),
            ScalarValue::Utf8(v) => Arc::new(StringArray::from(vec![v.clone(); len])),
        }
    }

    fn to_scalar(&self) -> Scalar<ArrayRef> {
        Scalar::new(self.to_array(1))
    }
}

/// Closed expression tree over batch columns.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Input column by ordinal position.
    Column(usize),
    Literal(ScalarValue),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
}

enum EvalValue {
    Array(ArrayRef),
    Scalar(ScalarValue),
}

impl EvalValue {
    fn into_array(self, len: usize) -> ArrayRef {
        match self {
            EvalValue::Array(array) => array,
            EvalValue::Scalar(scalar) => scalar.to_array(len),
        }
    }
}

impl Expr {
    pub fn col(index: usize) -> Expr {
        Expr::Column(index)
    }

    pub fn lit(value: ScalarValue) -> Expr {
        Expr::Literal(value)
    }

    pub fn lit_i64(value: i64) -> Expr {
        Expr::Literal(ScalarValue::Int64(Some(value)))
    }

    pub fn lit_f64(value: f64) -> Expr {
        Expr::Literal(ScalarValue::Float64(Some(value)))
    }

    /// Output type against `schema`, validating column references and
    /// operand type agreement. Used at node-construction time, so type
    /// errors fail the factory call instead of execution.
    pub fn data_type(&self, schema: &SchemaRef) -> Result<DataType> {
        match self {
            Expr::Column(index) => schema
                .fields()
                .get(*index)
                .map(|f| f.data_type().clone())
                .ok_or_else(|| {
                    EngineError::invalid_argument(format!(
                        "column index {index} out of bounds for schema with {} fields",
                        schema.fields().len()
                    ))
                }),
            Expr::Literal(value) => Ok(value.data_type()),
            Expr::Add(l, r)
            | Expr::Sub(l, r)
            | Expr::Mul(l, r)
            | Expr::Div(l, r)
            | Expr::Mod(l, r) => {
                let left = l.data_type(schema)?;
                let right = r.data_type(schema)?;
                if left != right {
                    return Err(EngineError::invalid_argument(format!(
                        "arithmetic operands must share one type, got {left} and {right}"
                    )));
                }
                Ok(left)
            }
            Expr::Eq(l, r)
            | Expr::Ne(l, r)
            | Expr::Lt(l, r)
            | Expr::Le(l, r)
            | Expr::Gt(l, r)
            | Expr::Ge(l, r) => {
                let left = l.data_type(schema)?;
                let right = r.data_type(schema)?;
                if left != right {
                    return Err(EngineError::invalid_argument(format!(
                        "comparison operands must share one type, got {left} and {right}"
                    )));
                }
                Ok(DataType::Boolean)
            }
            Expr::And(l, r) | Expr::Or(l, r) => {
                for side in [l, r] {
                    let dt = side.data_type(schema)?;
                    if dt != DataType::Boolean {
                        return Err(EngineError::invalid_argument(format!(
                            "boolean operand must be Boolean, got {dt}"
                        )));
                    }
                }
                Ok(DataType::Boolean)
            }
            Expr::Not(inner) => {
                let dt = inner.data_type(schema)?;
                if dt != DataType::Boolean {
                    return Err(EngineError::invalid_argument(format!(
                        "NOT operand must be Boolean, got {dt}"
                    )));
                }
                Ok(DataType::Boolean)
            }
            Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
                inner.data_type(schema)?;
                Ok(DataType::Boolean)
            }
        }
    }

    /// Evaluate against a batch, producing one array of `batch.len()`
    /// rows.
    pub fn eval(&self, batch: &Batch) -> Result<ArrayRef> {
        Ok(self.eval_value(batch)?.into_array(batch.len()))
    }

    fn eval_value(&self, batch: &Batch) -> Result<EvalValue> {
        match self {
            Expr::Column(index) => {
                if *index >= batch.num_columns() {
                    return Err(EngineError::invalid_argument(format!(
                        "column index {index} out of bounds for batch with {} columns",
                        batch.num_columns()
                    )));
                }
                Ok(EvalValue::Array(Arc::clone(batch.column(*index))))
            }
            Expr::Literal(value) => Ok(EvalValue::Scalar(value.clone())),
            Expr::Add(l, r) => self.eval_numeric(batch, l, r, numeric::add),
            Expr::Sub(l, r) => self.eval_numeric(batch, l, r, numeric::sub),
            Expr::Mul(l, r) => self.eval_numeric(batch, l, r, numeric::mul),
            Expr::Div(l, r) => self.eval_numeric(batch, l, r, numeric::div),
            Expr::Mod(l, r) => self.eval_numeric(batch, l, r, numeric::rem),
            Expr::Eq(l, r) => self.eval_cmp(batch, l, r, cmp::eq),
            Expr::Ne(l, r) => self.eval_cmp(batch, l, r, cmp::neq),
            Expr::Lt(l, r) => self.eval_cmp(batch, l, r, cmp::lt),
            Expr::Le(l, r) => self.eval_cmp(batch, l, r, cmp::lt_eq),
            Expr::Gt(l, r) => self.eval_cmp(batch, l, r, cmp::gt),
            Expr::Ge(l, r) => self.eval_cmp(batch, l, r, cmp::gt_eq),
            Expr::And(l, r) => {
                let left = boolean_operand(l.eval(batch)?)?;
                let right = boolean_operand(r.eval(batch)?)?;
                Ok(EvalValue::Array(Arc::new(and(&left, &right)?)))
            }
            Expr::Or(l, r) => {
                let left = boolean_operand(l.eval(batch)?)?;
                let right = boolean_operand(r.eval(batch)?)?;
                Ok(EvalValue::Array(Arc::new(or(&left, &right)?)))
            }
            Expr::Not(inner) => {
                let value = boolean_operand(inner.eval(batch)?)?;
                Ok(EvalValue::Array(Arc::new(not(&value)?)))
            }
            Expr::IsNull(inner) => {
                let value = inner.eval(batch)?;
                Ok(EvalValue::Array(Arc::new(is_null(value.as_ref())?)))
            }
            Expr::IsNotNull(inner) => {
                let value = inner.eval(batch)?;
                Ok(EvalValue::Array(Arc::new(is_not_null(value.as_ref())?)))
            }
        }
    }

    fn eval_numeric(
        &self,
        batch: &Batch,
        l: &Expr,
        r: &Expr,
        kernel: impl Fn(
            &dyn arrow::array::Datum,
            &dyn arrow::array::Datum,
        ) -> std::result::Result<ArrayRef, arrow::error::ArrowError>,
    ) -> Result<EvalValue> {
        let left = l.eval_value(batch)?;
        let right = r.eval_value(batch)?;
        let out = match (&left, &right) {
            (EvalValue::Array(a), EvalValue::Array(b)) => kernel(
                &a.as_ref() as &dyn arrow::array::Datum,
                &b.as_ref() as &dyn arrow::array::Datum,
            )?,
            (EvalValue::Array(a), EvalValue::Scalar(s)) => {
                kernel(&a.as_ref() as &dyn arrow::array::Datum, &s.to_scalar())?
            }
            (EvalValue::Scalar(s), EvalValue::Array(b)) => {
                kernel(&s.to_scalar(), &b.as_ref() as &dyn arrow::array::Datum)?
            }
            (EvalValue::Scalar(a), EvalValue::Scalar(b)) => {
                kernel(&a.to_scalar(), &b.to_scalar())?
            }
        };
        Ok(EvalValue::Array(out))
    }

    fn eval_cmp(
        &self,
        batch: &Batch,
        l: &Expr,
        r: &Expr,
        kernel: impl Fn(
            &dyn arrow::array::Datum,
            &dyn arrow::array::Datum,
        ) -> std::result::Result<BooleanArray, arrow::error::ArrowError>,
    ) -> Result<EvalValue> {
        let left = l.eval_value(batch)?;
        let right = r.eval_value(batch)?;
        let out = match (&left, &right) {
            (EvalValue::Array(a), EvalValue::Array(b)) => kernel(
                &a.as_ref() as &dyn arrow::array::Datum,
                &b.as_ref() as &dyn arrow::array::Datum,
            )?,
            (EvalValue::Array(a), EvalValue::Scalar(s)) => {
                kernel(&a.as_ref() as &dyn arrow::array::Datum, &s.to_scalar())?
            }
            (EvalValue::Scalar(s), EvalValue::Array(b)) => {
                kernel(&s.to_scalar(), &b.as_ref() as &dyn arrow::array::Datum)?
            }
            (EvalValue::Scalar(a), EvalValue::Scalar(b)) => {
                kernel(&a.to_scalar(), &b.to_scalar())?
            }
        };
        Ok(EvalValue::Array(Arc::new(out)))
    }
}

fn boolean_operand(array: ArrayRef) -> Result<BooleanArray> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .cloned()
        .ok_or_else(|| {
            EngineError::execution(format!(
                "boolean kernel received non-boolean operand of type {}",
                array.data_type()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::batch::tests::int64_batch;
    use arrow::array::Array;

    #[test]
    fn comparison_with_literal() {
        let batch = int64_batch("x", &[1, 5, 3, 9]);
        let predicate = Expr::Gt(Box::new(Expr::col(0)), Box::new(Expr::lit_i64(3)));
        let mask = predicate.eval(&batch).expect("eval");
        let mask = mask.as_any().downcast_ref::<BooleanArray>().expect("bool");
        let selected: Vec<bool> = mask.iter().map(|v| v.expect("non-null")).collect();
        assert_eq!(selected, vec![false, true, false, true]);
    }

    #[test]
    fn arithmetic_on_columns() {
        let batch = int64_batch("x", &[1, 2, 3]);
        let doubled = Expr::Add(Box::new(Expr::col(0)), Box::new(Expr::col(0)));
        let out = doubled.eval(&batch).expect("eval");
        let out = out.as_any().downcast_ref::<Int64Array>().expect("i64");
        assert_eq!(out.values(), &[2, 4, 6]);
    }

    #[test]
    fn data_type_rejects_mismatched_operands() {
        let batch = int64_batch("x", &[1]);
        let bad = Expr::Add(Box::new(Expr::col(0)), Box::new(Expr::lit_f64(1.0)));
        let err = bad.data_type(&batch.schema()).expect_err("must fail");
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn data_type_rejects_out_of_bounds_column() {
        let batch = int64_batch("x", &[1]);
        let err = Expr::col(3).data_type(&batch.schema()).expect_err("must fail");
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
