/// Filter, expression and pipeline evaluation for the in-memory document
/// store. Covers the operator subset the document compiler emits plus the
/// usual neighbours (`$exists`, `$size`, `$push`, ...).

use super::store::StoreResult;
use pstore_core::DocumentFailure;
use regex::Regex;
use serde_json::{Map, Value as Json};
use std::cmp::Ordering;
use std::collections::HashMap;

fn bad_value(message: impl Into<String>) -> DocumentFailure {
    DocumentFailure::new(2, message)
}

/// Value at a dotted path; `None` when any segment is missing
pub(super) fn lookup<'a>(doc: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Json::Object(map) => map.get(segment),
        Json::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn type_rank(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::Number(_) => 1,
        Json::String(_) => 2,
        Json::Object(_) => 3,
        Json::Array(_) => 4,
        Json::Bool(_) => 5,
    }
}

/// Total order across types: null < numbers < strings < objects < arrays < booleans
pub(super) fn compare(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Json::String(x), Json::String(y)) => x.cmp(y),
        (Json::Bool(x), Json::Bool(y)) => x.cmp(y),
        (Json::Array(x), Json::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| compare(l, r))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Json::Object(x), Json::Object(y)) => x
            .iter()
            .zip(y)
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare(lv, rv)))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn truthy(value: &Json) -> bool {
    match value {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        _ => true,
    }
}

/// True when `pred` holds for the value or, for arrays, any element
fn any_candidate(value: &Json, mut pred: impl FnMut(&Json) -> bool) -> bool {
    if pred(value) {
        return true;
    }
    match value {
        Json::Array(items) => items.iter().any(pred),
        _ => false,
    }
}

fn eq_match(value: Option<&Json>, target: &Json) -> bool {
    match value {
        None => target.is_null(),
        Some(v) => any_candidate(v, |c| compare(c, target).is_eq()),
    }
}

fn compile_regex(pattern: &Json, options: Option<&Json>) -> StoreResult<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| bad_value("$regex has to be a string"))?;
    let flags = options.and_then(Json::as_str).unwrap_or_default();
    let full = if flags.is_empty() {
        pattern.to_string()
    } else {
        format!("(?{}){}", flags, pattern)
    };
    Regex::new(&full).map_err(|e| bad_value(format!("invalid $regex: {}", e)))
}

/// Does `doc` satisfy `filter`?
pub(super) fn matches(doc: &Json, filter: &Json) -> StoreResult<bool> {
    let clauses = filter
        .as_object()
        .ok_or_else(|| bad_value("filter must be an object"))?;
    for (key, cond) in clauses {
        let ok = match key.as_str() {
            "$and" => all_match(doc, sub_filters(key, cond)?)?,
            "$or" => any_match(doc, sub_filters(key, cond)?)?,
            "$nor" => !any_match(doc, sub_filters(key, cond)?)?,
            "$expr" => truthy(&eval_expr(doc, cond)?),
            op if op.starts_with('$') => {
                return Err(bad_value(format!("unknown top level operator: {}", op)));
            }
            path => field_matches(lookup(doc, path), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_filters<'a>(op: &str, cond: &'a Json) -> StoreResult<&'a [Json]> {
    match cond.as_array() {
        Some(items) if !items.is_empty() => Ok(items),
        _ => Err(bad_value(format!("{} must be a nonempty array", op))),
    }
}

fn all_match(doc: &Json, filters: &[Json]) -> StoreResult<bool> {
    for f in filters {
        if !matches(doc, f)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_match(doc: &Json, filters: &[Json]) -> StoreResult<bool> {
    for f in filters {
        if matches(doc, f)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_doc(cond: &Json) -> bool {
    cond.as_object()
        .map_or(false, |m| !m.is_empty() && m.keys().all(|k| k.starts_with('$')))
}

fn field_matches(value: Option<&Json>, cond: &Json) -> StoreResult<bool> {
    if !is_operator_doc(cond) {
        return Ok(eq_match(value, cond));
    }
    let ops = cond.as_object().map(|m| m.iter()).into_iter().flatten();
    for (op, arg) in ops {
        if !operator_matches(value, op, arg, cond)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operator_matches(value: Option<&Json>, op: &str, arg: &Json, siblings: &Json) -> StoreResult<bool> {
    let ordered = |accept: fn(Ordering) -> bool| match value {
        Some(v) => any_candidate(v, |c| type_rank(c) == type_rank(arg) && accept(compare(c, arg))),
        None => false,
    };
    Ok(match op {
        "$eq" => eq_match(value, arg),
        "$ne" => !eq_match(value, arg),
        "$gt" => ordered(Ordering::is_gt),
        "$gte" => ordered(Ordering::is_ge) || (arg.is_null() && eq_match(value, arg)),
        "$lt" => ordered(Ordering::is_lt),
        "$lte" => ordered(Ordering::is_le) || (arg.is_null() && eq_match(value, arg)),
        "$in" => in_list(value, arg)?,
        "$nin" => !in_list(value, arg)?,
        "$exists" => truthy(arg) == value.is_some(),
        "$regex" => {
            let re = compile_regex(arg, siblings.get("$options"))?;
            value.map_or(false, |v| any_candidate(v, |c| c.as_str().map_or(false, |s| re.is_match(s))))
        }
        "$options" => true,
        "$not" => {
            if !is_operator_doc(arg) {
                return Err(bad_value("$not needs an operator document"));
            }
            !field_matches(value, arg)?
        }
        "$size" => {
            let n = arg.as_u64().ok_or_else(|| bad_value("$size needs a non-negative integer"))?;
            value.and_then(Json::as_array).map_or(false, |items| items.len() as u64 == n)
        }
        other => return Err(bad_value(format!("unknown operator: {}", other))),
    })
}

fn in_list(value: Option<&Json>, arg: &Json) -> StoreResult<bool> {
    let items = arg.as_array().ok_or_else(|| bad_value("$in needs an array"))?;
    Ok(items.iter().any(|item| eq_match(value, item)))
}

/// Evaluate an aggregation expression against `doc`. Missing fields yield null.
pub(super) fn eval_expr(doc: &Json, expr: &Json) -> StoreResult<Json> {
    match expr {
        Json::String(s) if s.starts_with('$') => Ok(lookup(doc, &s[1..]).cloned().unwrap_or(Json::Null)),
        Json::Array(items) => items
            .iter()
            .map(|e| eval_expr(doc, e))
            .collect::<StoreResult<Vec<_>>>()
            .map(Json::Array),
        Json::Object(map) => match map.iter().next() {
            Some((op, arg)) if map.len() == 1 && op.starts_with('$') => eval_operator(doc, op, arg),
            _ => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), eval_expr(doc, v)?);
                }
                Ok(Json::Object(out))
            }
        },
        other => Ok(other.clone()),
    }
}

fn operands(doc: &Json, arg: &Json) -> StoreResult<Vec<Json>> {
    match arg {
        Json::Array(items) => items.iter().map(|e| eval_expr(doc, e)).collect(),
        single => Ok(vec![eval_expr(doc, single)?]),
    }
}

fn pair(op: &str, args: Vec<Json>) -> StoreResult<(Json, Json)> {
    let mut it = args.into_iter();
    match (it.next(), it.next(), it.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(bad_value(format!("{} takes exactly 2 arguments", op))),
    }
}

fn eval_operator(doc: &Json, op: &str, arg: &Json) -> StoreResult<Json> {
    let args = operands(doc, arg)?;
    let cmp = |accept: fn(Ordering) -> bool, args: Vec<Json>| -> StoreResult<Json> {
        let (a, b) = pair(op, args)?;
        Ok(Json::Bool(accept(compare(&a, &b))))
    };
    match op {
        "$eq" => cmp(Ordering::is_eq, args),
        "$ne" => cmp(Ordering::is_ne, args),
        "$gt" => cmp(Ordering::is_gt, args),
        "$gte" => cmp(Ordering::is_ge, args),
        "$lt" => cmp(Ordering::is_lt, args),
        "$lte" => cmp(Ordering::is_le, args),
        "$in" => {
            let (needle, haystack) = pair(op, args)?;
            let items = haystack
                .as_array()
                .ok_or_else(|| bad_value("$in requires an array as a second argument"))?;
            Ok(Json::Bool(items.iter().any(|i| compare(i, &needle).is_eq())))
        }
        "$not" => Ok(Json::Bool(!args.first().map_or(false, truthy))),
        "$and" => Ok(Json::Bool(args.iter().all(truthy))),
        "$or" => Ok(Json::Bool(args.iter().any(truthy))),
        "$size" => match args.as_slice() {
            [Json::Array(items)] => Ok(Json::from(items.len() as u64)),
            _ => Err(bad_value("the argument to $size must be an array")),
        },
        "$ifNull" => {
            let last = args.last().cloned().unwrap_or(Json::Null);
            Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(last))
        }
        "$arrayElemAt" => {
            let (array, index) = pair(op, args)?;
            let items = array
                .as_array()
                .ok_or_else(|| bad_value("$arrayElemAt's first argument must be an array"))?;
            let index = index
                .as_i64()
                .ok_or_else(|| bad_value("$arrayElemAt's second argument must be an integer"))?;
            let position = if index < 0 { items.len() as i64 + index } else { index };
            Ok(usize::try_from(position)
                .ok()
                .and_then(|p| items.get(p))
                .cloned()
                .unwrap_or(Json::Null))
        }
        other => Err(DocumentFailure::new(
            168,
            format!("unsupported expression '{}'", other),
        )),
    }
}

/// Apply a find-style projection
pub(super) fn project(doc: &Json, spec: &Json) -> StoreResult<Json> {
    let spec = spec
        .as_object()
        .ok_or_else(|| bad_value("projection must be an object"))?;
    let flag = |v: &Json| match v {
        Json::Bool(_) | Json::Number(_) => Some(truthy(v)),
        _ => None,
    };
    let inclusion = spec
        .iter()
        .any(|(k, v)| k != "_id" && flag(v).unwrap_or(true));

    if !inclusion {
        let mut out = doc.clone();
        if let Json::Object(map) = &mut out {
            for key in spec.keys() {
                map.remove(key);
            }
        }
        return Ok(out);
    }

    let mut out = Map::new();
    // A computed `_id` is written by the loop below
    let keep_id = spec.get("_id").map_or(true, |v| flag(v) == Some(true));
    if keep_id {
        if let Some(id) = lookup(doc, "_id") {
            out.insert("_id".into(), id.clone());
        }
    }
    for (key, v) in spec {
        match flag(v) {
            Some(true) if key != "_id" => {
                if let Some(found) = lookup(doc, key) {
                    out.insert(key.clone(), found.clone());
                }
            }
            Some(_) => {}
            None => {
                out.insert(key.clone(), eval_expr(doc, v)?);
            }
        }
    }
    Ok(Json::Object(out))
}

/// Stable sort by `(path, 1 | -1)` keys; missing fields sort as null
pub(super) fn sort_docs(docs: &mut [Json], keys: &[(String, i32)]) {
    docs.sort_by(|a, b| {
        keys.iter()
            .map(|(path, dir)| {
                let l = lookup(a, path).unwrap_or(&Json::Null);
                let r = lookup(b, path).unwrap_or(&Json::Null);
                let o = compare(l, r);
                if *dir < 0 { o.reverse() } else { o }
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

fn sort_keys(spec: &Json) -> StoreResult<Vec<(String, i32)>> {
    let map = spec
        .as_object()
        .ok_or_else(|| bad_value("$sort needs an object"))?;
    map.iter()
        .map(|(k, v)| match v.as_i64() {
            Some(1) => Ok((k.clone(), 1)),
            Some(-1) => Ok((k.clone(), -1)),
            _ => Err(bad_value("$sort key ordering must be 1 or -1")),
        })
        .collect()
}

/// Run an aggregation pipeline over `docs`
pub(super) fn run_pipeline(docs: Vec<Json>, pipeline: &[Json]) -> StoreResult<Vec<Json>> {
    pipeline.iter().try_fold(docs, run_stage)
}

fn run_stage(mut docs: Vec<Json>, stage: &Json) -> StoreResult<Vec<Json>> {
    let (name, spec) = stage
        .as_object()
        .filter(|m| m.len() == 1)
        .and_then(|m| m.iter().next())
        .ok_or_else(|| bad_value("a pipeline stage must be an object with exactly one field"))?;

    match name.as_str() {
        "$match" => {
            let mut kept = Vec::with_capacity(docs.len());
            for doc in docs {
                if matches(&doc, spec)? {
                    kept.push(doc);
                }
            }
            Ok(kept)
        }
        "$group" => group(docs, spec),
        "$project" => docs.iter().map(|d| project(d, spec)).collect(),
        "$sort" => {
            sort_docs(&mut docs, &sort_keys(spec)?);
            Ok(docs)
        }
        "$skip" => {
            let n = spec.as_u64().ok_or_else(|| bad_value("$skip needs a non-negative integer"))?;
            Ok(docs.into_iter().skip(n as usize).collect())
        }
        "$limit" => {
            let n = spec.as_u64().ok_or_else(|| bad_value("$limit needs a non-negative integer"))?;
            docs.truncate(n as usize);
            Ok(docs)
        }
        "$count" => {
            let field = spec
                .as_str()
                .filter(|s| !s.is_empty() && !s.starts_with('$'))
                .ok_or_else(|| bad_value("$count needs a field name"))?;
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Map::new();
            out.insert(field.to_string(), Json::from(docs.len() as u64));
            Ok(vec![Json::Object(out)])
        }
        other => Err(DocumentFailure::new(
            40324,
            format!("unsupported pipeline stage '{}'", other),
        )),
    }
}

enum Accumulator {
    Sum { int: i64, float: f64, all_int: bool },
    Avg { total: f64, n: u64 },
    First(Option<Json>),
    Last(Json),
    Min(Option<Json>),
    Max(Option<Json>),
    Push(Vec<Json>),
}

impl Accumulator {
    fn new(op: &str) -> StoreResult<Self> {
        Ok(match op {
            "$sum" => Accumulator::Sum { int: 0, float: 0.0, all_int: true },
            "$avg" => Accumulator::Avg { total: 0.0, n: 0 },
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(Json::Null),
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$push" => Accumulator::Push(Vec::new()),
            other => {
                return Err(DocumentFailure::new(
                    168,
                    format!("unsupported accumulator '{}'", other),
                ))
            }
        })
    }

    fn add(&mut self, value: Json) {
        match self {
            Accumulator::Sum { int, float, all_int } => {
                if let Some(n) = value.as_i64() {
                    *int = int.wrapping_add(n);
                    *float += n as f64;
                } else if let Some(f) = value.as_f64() {
                    *all_int = false;
                    *float += f;
                }
            }
            Accumulator::Avg { total, n } => {
                if let Some(f) = value.as_f64() {
                    *total += f;
                    *n += 1;
                }
            }
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(value);
                }
            }
            Accumulator::Last(last) => *last = value,
            Accumulator::Min(min) => {
                if !value.is_null() && min.as_ref().map_or(true, |m| compare(&value, m).is_lt()) {
                    *min = Some(value);
                }
            }
            Accumulator::Max(max) => {
                if !value.is_null() && max.as_ref().map_or(true, |m| compare(&value, m).is_gt()) {
                    *max = Some(value);
                }
            }
            Accumulator::Push(items) => items.push(value),
        }
    }

    fn finish(self) -> Json {
        match self {
            Accumulator::Sum { int, all_int: true, .. } => Json::from(int),
            Accumulator::Sum { float, .. } => Json::from(float),
            Accumulator::Avg { n: 0, .. } => Json::Null,
            Accumulator::Avg { total, n } => Json::from(total / n as f64),
            Accumulator::First(v) | Accumulator::Min(v) | Accumulator::Max(v) => v.unwrap_or(Json::Null),
            Accumulator::Last(v) => v,
            Accumulator::Push(items) => Json::Array(items),
        }
    }
}

/// `$group`: groups keep first-seen order
fn group(docs: Vec<Json>, spec: &Json) -> StoreResult<Vec<Json>> {
    let spec = spec
        .as_object()
        .ok_or_else(|| bad_value("$group needs an object"))?;
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| bad_value("a group specification must include an _id"))?;

    let mut fields = Vec::new();
    for (name, acc) in spec.iter().filter(|(k, _)| k.as_str() != "_id") {
        let (op, arg) = acc
            .as_object()
            .filter(|m| m.len() == 1)
            .and_then(|m| m.iter().next())
            .ok_or_else(|| bad_value(format!("the field '{}' must be an accumulator object", name)))?;
        Accumulator::new(op)?;
        fields.push((name.clone(), op.clone(), arg.clone()));
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(Json, Vec<Accumulator>)> = Vec::new();
    for doc in &docs {
        let key = eval_expr(doc, id_expr)?;
        let slot = match index.get(&key.to_string()) {
            Some(&i) => i,
            None => {
                let accs = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<StoreResult<Vec<_>>>()?;
                index.insert(key.to_string(), groups.len());
                groups.push((key, accs));
                groups.len() - 1
            }
        };
        for ((_, _, arg), acc) in fields.iter().zip(groups[slot].1.iter_mut()) {
            acc.add(eval_expr(doc, arg)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|(key, accs)| {
            let mut out = Map::new();
            out.insert("_id".into(), key);
            for ((name, _, _), acc) in fields.iter().zip(accs) {
                out.insert(name.clone(), acc.finish());
            }
            Json::Object(out)
        })
        .collect())
}
