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
//! Built-in aggregate kernels: sum, count, min, max, mean.
//!
//! Numeric kernels are generic over the arrow primitive type and
//! instantiated for Int64/Float64; count accepts any input type.

use std::any::Any;
use std::ops::Add;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, PrimitiveArray};
use arrow::datatypes::{ArrowNumericType, DataType, Float64Type, Int64Type};

use crate::common::error::{EngineError, Result};
use crate::exec::expr::ScalarValue;

use super::{HashAggKernel, ScalarAggKernel};

/// Bridge from a primitive native value to the engine scalar type.
pub(super) trait NativeScalar: Copy + Send + 'static {
    const DATA_TYPE: DataType;
    fn scalar(value: Option<Self>) -> ScalarValue;
    fn to_f64(self) -> f64;
}

impl NativeScalar for i64 {
    const DATA_TYPE: DataType = DataType::Int64;

    fn scalar(value: Option<Self>) -> ScalarValue {
        ScalarValue::Int64(value)
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl NativeScalar for f64 {
    const DATA_TYPE: DataType = DataType::Float64;

    fn scalar(value: Option<Self>) -> ScalarValue {
        ScalarValue::Float64(value)
    }

    fn to_f64(self) -> f64 {
        self
    }
}

fn downcast_primitive<'a, T: ArrowNumericType>(
    values: &'a ArrayRef,
    function: &str,
) -> Result<&'a PrimitiveArray<T>> {
    values
        .as_any()
        .downcast_ref::<PrimitiveArray<T>>()
        .ok_or_else(|| EngineError::kernel_dispatch(function, values.data_type()))
}

fn merge_downcast<K: 'static>(other: Box<dyn Any>, function: &str) -> Result<Box<K>> {
    other.downcast::<K>().map_err(|_| {
        EngineError::execution(format!("mismatched '{function}' kernel state in merge"))
    })
}

fn check_transposition(len: usize, transposition: &[u32]) -> Result<()> {
    if transposition.len() != len {
        return Err(EngineError::execution(format!(
            "transposition covers {} groups, state has {}",
            transposition.len(),
            len
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// sum

struct ScalarSum<T: ArrowNumericType> {
    sum: T::Native,
    seen: bool,
}

impl<T: ArrowNumericType> ScalarSum<T>
where
    T::Native: Default,
{
    fn new() -> Self {
        Self {
            sum: T::Native::default(),
            seen: false,
        }
    }
}

impl<T: ArrowNumericType> ScalarAggKernel for ScalarSum<T>
where
    T::Native: NativeScalar + Add<Output = T::Native> + Default,
{
    fn consume(&mut self, values: &ArrayRef) -> Result<()> {
        let values = downcast_primitive::<T>(values, "sum")?;
        for i in 0..values.len() {
            if values.is_valid(i) {
                self.sum = self.sum + values.value(i);
                self.seen = true;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn ScalarAggKernel>) -> Result<()> {
        let other = merge_downcast::<Self>(other.into_any(), "sum")?;
        if other.seen {
            self.sum = self.sum + other.sum;
            self.seen = true;
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ScalarValue> {
        Ok(T::Native::scalar(self.seen.then_some(self.sum)))
    }

    fn output_type(&self) -> DataType {
        T::Native::DATA_TYPE
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

struct HashSum<T: ArrowNumericType> {
    sums: Vec<T::Native>,
    seen: Vec<bool>,
}

impl<T: ArrowNumericType> HashAggKernel for HashSum<T>
where
    T::Native: NativeScalar + Add<Output = T::Native> + Default,
{
    fn resize(&mut self, num_groups: usize) {
        if num_groups > self.sums.len() {
            self.sums.resize(num_groups, T::Native::default());
            self.seen.resize(num_groups, false);
        }
    }

    fn consume(&mut self, values: &ArrayRef, group_ids: &[u32]) -> Result<()> {
        let values = downcast_primitive::<T>(values, "sum")?;
        for (i, group) in group_ids.iter().enumerate() {
            if values.is_valid(i) {
                let group = *group as usize;
                self.sums[group] = self.sums[group] + values.value(i);
                self.seen[group] = true;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn HashAggKernel>, transposition: &[u32]) -> Result<()> {
        let other = merge_downcast::<Self>(other.into_any(), "sum")?;
        check_transposition(other.sums.len(), transposition)?;
        for (old, new) in transposition.iter().enumerate() {
            if other.seen[old] {
                let new = *new as usize;
                self.sums[new] = self.sums[new] + other.sums[old];
                self.seen[new] = true;
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ArrayRef> {
        let array: PrimitiveArray<T> = self
            .sums
            .iter()
            .zip(self.seen.iter())
            .map(|(sum, seen)| seen.then_some(*sum))
            .collect();
        Ok(Arc::new(array))
    }

    fn output_type(&self) -> DataType {
        T::Native::DATA_TYPE
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ---------------------------------------------------------------------------
// count (non-null values, any input type)

#[derive(Default)]
struct ScalarCount {
    count: i64,
}

impl ScalarAggKernel for ScalarCount {
    fn consume(&mut self, values: &ArrayRef) -> Result<()> {
        self.count += (values.len() - values.null_count()) as i64;
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn ScalarAggKernel>) -> Result<()> {
        let other = merge_downcast::<Self>(other.into_any(), "count")?;
        self.count += other.count;
        Ok(())
    }

    fn finalize(&mut self) -> Result<ScalarValue> {
        Ok(ScalarValue::Int64(Some(self.count)))
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[derive(Default)]
struct HashCount {
    counts: Vec<i64>,
}

impl HashAggKernel for HashCount {
    fn resize(&mut self, num_groups: usize) {
        if num_groups > self.counts.len() {
            self.counts.resize(num_groups, 0);
        }
    }

    fn consume(&mut self, values: &ArrayRef, group_ids: &[u32]) -> Result<()> {
        for (i, group) in group_ids.iter().enumerate() {
            if values.is_valid(i) {
                self.counts[*group as usize] += 1;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn HashAggKernel>, transposition: &[u32]) -> Result<()> {
        let other = merge_downcast::<Self>(other.into_any(), "count")?;
        check_transposition(other.counts.len(), transposition)?;
        for (old, new) in transposition.iter().enumerate() {
            self.counts[*new as usize] += other.counts[old];
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ArrayRef> {
        Ok(Arc::new(Int64Array::from(std::mem::take(&mut self.counts))))
    }

    fn output_type(&self) -> DataType {
        DataType::Int64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ---------------------------------------------------------------------------
// min / max

struct ScalarMinMax<T: ArrowNumericType> {
    value: Option<T::Native>,
    is_min: bool,
}

impl<T: ArrowNumericType> ScalarMinMax<T>
where
    T::Native: PartialOrd,
{
    fn better(&self, candidate: T::Native) -> bool {
        match self.value {
            None => true,
            Some(current) => {
                if self.is_min {
                    candidate < current
                } else {
                    candidate > current
                }
            }
        }
    }

    fn function(&self) -> &'static str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }
}

impl<T: ArrowNumericType> ScalarAggKernel for ScalarMinMax<T>
where
    T::Native: NativeScalar + PartialOrd,
{
    fn consume(&mut self, values: &ArrayRef) -> Result<()> {
        let values = downcast_primitive::<T>(values, self.function())?;
        for i in 0..values.len() {
            if values.is_valid(i) && self.better(values.value(i)) {
                self.value = Some(values.value(i));
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn ScalarAggKernel>) -> Result<()> {
        let function = self.function();
        let other = merge_downcast::<Self>(other.into_any(), function)?;
        if let Some(candidate) = other.value {
            if self.better(candidate) {
                self.value = Some(candidate);
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ScalarValue> {
        Ok(T::Native::scalar(self.value))
    }

    fn output_type(&self) -> DataType {
        T::Native::DATA_TYPE
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

struct HashMinMax<T: ArrowNumericType> {
    values: Vec<Option<T::Native>>,
    is_min: bool,
}

impl<T: ArrowNumericType> HashMinMax<T>
where
    T::Native: PartialOrd,
{
    fn better(&self, slot: usize, candidate: T::Native) -> bool {
        match self.values[slot] {
            None => true,
            Some(current) => {
                if self.is_min {
                    candidate < current
                } else {
                    candidate > current
                }
            }
        }
    }

    fn function(&self) -> &'static str {
        if self.is_min {
            "min"
        } else {
            "max"
        }
    }
}

impl<T: ArrowNumericType> HashAggKernel for HashMinMax<T>
where
    T::Native: NativeScalar + PartialOrd,
{
    fn resize(&mut self, num_groups: usize) {
        if num_groups > self.values.len() {
            self.values.resize(num_groups, None);
        }
    }

    fn consume(&mut self, values: &ArrayRef, group_ids: &[u32]) -> Result<()> {
        let function = self.function();
        let values = downcast_primitive::<T>(values, function)?;
        for (i, group) in group_ids.iter().enumerate() {
            if values.is_valid(i) {
                let group = *group as usize;
                if self.better(group, values.value(i)) {
                    self.values[group] = Some(values.value(i));
                }
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn HashAggKernel>, transposition: &[u32]) -> Result<()> {
        let function = self.function();
        let other = merge_downcast::<Self>(other.into_any(), function)?;
        check_transposition(other.values.len(), transposition)?;
        for (old, new) in transposition.iter().enumerate() {
            if let Some(candidate) = other.values[old] {
                let new = *new as usize;
                if self.better(new, candidate) {
                    self.values[new] = Some(candidate);
                }
            }
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ArrayRef> {
        let array: PrimitiveArray<T> = self.values.iter().copied().collect();
        Ok(Arc::new(array))
    }

    fn output_type(&self) -> DataType {
        T::Native::DATA_TYPE
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ---------------------------------------------------------------------------
// mean (always Float64 output)

// The marker is `fn() -> T` so the struct stays `Send` without a `Send`
// bound on the arrow type parameter.
struct ScalarMean<T: ArrowNumericType> {
    sum: f64,
    count: i64,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: ArrowNumericType> ScalarAggKernel for ScalarMean<T>
where
    T::Native: NativeScalar,
{
    fn consume(&mut self, values: &ArrayRef) -> Result<()> {
        let values = downcast_primitive::<T>(values, "mean")?;
        for i in 0..values.len() {
            if values.is_valid(i) {
                self.sum += values.value(i).to_f64();
                self.count += 1;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn ScalarAggKernel>) -> Result<()> {
        let other = merge_downcast::<Self>(other.into_any(), "mean")?;
        self.sum += other.sum;
        self.count += other.count;
        Ok(())
    }

    fn finalize(&mut self) -> Result<ScalarValue> {
        Ok(ScalarValue::Float64(
            (self.count > 0).then(|| self.sum / self.count as f64),
        ))
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

struct HashMean<T: ArrowNumericType> {
    sums: Vec<f64>,
    counts: Vec<i64>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: ArrowNumericType> HashAggKernel for HashMean<T>
where
    T::Native: NativeScalar,
{
    fn resize(&mut self, num_groups: usize) {
        if num_groups > self.sums.len() {
            self.sums.resize(num_groups, 0.0);
            self.counts.resize(num_groups, 0);
        }
    }

    fn consume(&mut self, values: &ArrayRef, group_ids: &[u32]) -> Result<()> {
        let values = downcast_primitive::<T>(values, "mean")?;
        for (i, group) in group_ids.iter().enumerate() {
            if values.is_valid(i) {
                let group = *group as usize;
                self.sums[group] += values.value(i).to_f64();
                self.counts[group] += 1;
            }
        }
        Ok(())
    }

    fn merge(&mut self, other: Box<dyn HashAggKernel>, transposition: &[u32]) -> Result<()> {
        let other = merge_downcast::<Self>(other.into_any(), "mean")?;
        check_transposition(other.sums.len(), transposition)?;
        for (old, new) in transposition.iter().enumerate() {
            let new = *new as usize;
            self.sums[new] += other.sums[old];
            self.counts[new] += other.counts[old];
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<ArrayRef> {
        let array = Float64Array::from_iter(
            self.sums
                .iter()
                .zip(self.counts.iter())
                .map(|(sum, count)| (*count > 0).then(|| sum / *count as f64)),
        );
        Ok(Arc::new(array))
    }

    fn output_type(&self) -> DataType {
        DataType::Float64
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

// ---------------------------------------------------------------------------
// constructors and output-type resolvers used by the registry

pub(super) fn make_scalar_sum(input: &DataType) -> Result<Box<dyn ScalarAggKernel>> {
    match input {
        DataType::Int64 => Ok(Box::new(ScalarSum::<Int64Type>::new())),
        DataType::Float64 => Ok(Box::new(ScalarSum::<Float64Type>::new())),
        other => Err(EngineError::kernel_dispatch("sum", other)),
    }
}

pub(super) fn make_hash_sum(input: &DataType) -> Result<Box<dyn HashAggKernel>> {
    match input {
        DataType::Int64 => Ok(Box::new(HashSum::<Int64Type> {
            sums: Vec::new(),
            seen: Vec::new(),
        })),
        DataType::Float64 => Ok(Box::new(HashSum::<Float64Type> {
            sums: Vec::new(),
            seen: Vec::new(),
        })),
        other => Err(EngineError::kernel_dispatch("sum", other)),
    }
}

pub(super) fn make_scalar_count(_input: &DataType) -> Result<Box<dyn ScalarAggKernel>> {
    Ok(Box::new(ScalarCount::default()))
}

pub(super) fn make_hash_count(_input: &DataType) -> Result<Box<dyn HashAggKernel>> {
    Ok(Box::new(HashCount::default()))
}

pub(super) fn make_scalar_min(input: &DataType) -> Result<Box<dyn ScalarAggKernel>> {
    make_scalar_min_max(input, true)
}

pub(super) fn make_scalar_max(input: &DataType) -> Result<Box<dyn ScalarAggKernel>> {
    make_scalar_min_max(input, false)
}

fn make_scalar_min_max(input: &DataType, is_min: bool) -> Result<Box<dyn ScalarAggKernel>> {
    match input {
        DataType::Int64 => Ok(Box::new(ScalarMinMax::<Int64Type> {
            value: None,
            is_min,
        })),
        DataType::Float64 => Ok(Box::new(ScalarMinMax::<Float64Type> {
            value: None,
            is_min,
        })),
        other => Err(EngineError::kernel_dispatch(
            if is_min { "min" } else { "max" },
            other,
        )),
    }
}

pub(super) fn make_hash_min(input: &DataType) -> Result<Box<dyn HashAggKernel>> {
    make_hash_min_max(input, true)
}

pub(super) fn make_hash_max(input: &DataType) -> Result<Box<dyn HashAggKernel>> {
    make_hash_min_max(input, false)
}

fn make_hash_min_max(input: &DataType, is_min: bool) -> Result<Box<dyn HashAggKernel>> {
    match input {
        DataType::Int64 => Ok(Box::new(HashMinMax::<Int64Type> {
            values: Vec::new(),
            is_min,
        })),
        DataType::Float64 => Ok(Box::new(HashMinMax::<Float64Type> {
            values: Vec::new(),
            is_min,
        })),
        other => Err(EngineError::kernel_dispatch(
            if is_min { "min" } else { "max" },
            other,
        )),
    }
}

pub(super) fn make_scalar_mean(input: &DataType) -> Result<Box<dyn ScalarAggKernel>> {
    match input {
        DataType::Int64 => Ok(Box::new(ScalarMean::<Int64Type> {
            sum: 0.0,
            count: 0,
            _marker: std::marker::PhantomData,
        })),
        DataType::Float64 => Ok(Box::new(ScalarMean::<Float64Type> {
            sum: 0.0,
            count: 0,
            _marker: std::marker::PhantomData,
        })),
        other => Err(EngineError::kernel_dispatch("mean", other)),
    }
}

pub(super) fn make_hash_mean(input: &DataType) -> Result<Box<dyn HashAggKernel>> {
    match input {
        DataType::Int64 => Ok(Box::new(HashMean::<Int64Type> {
            sums: Vec::new(),
            counts: Vec::new(),
            _marker: std::marker::PhantomData,
        })),
        DataType::Float64 => Ok(Box::new(HashMean::<Float64Type> {
            sums: Vec::new(),
            counts: Vec::new(),
            _marker: std::marker::PhantomData,
        })),
        other => Err(EngineError::kernel_dispatch("mean", other)),
    }
}

pub(super) fn numeric_identity_type(input: &DataType) -> Result<DataType> {
    match input {
        DataType::Int64 | DataType::Float64 => Ok(input.clone()),
        other => Err(EngineError::kernel_dispatch("numeric aggregate", other)),
    }
}

pub(super) fn count_output_type(_input: &DataType) -> Result<DataType> {
    Ok(DataType::Int64)
}

pub(super) fn mean_output_type(input: &DataType) -> Result<DataType> {
    match input {
        DataType::Int64 | DataType::Float64 => Ok(DataType::Float64),
        other => Err(EngineError::kernel_dispatch("mean", other)),
    }
}
