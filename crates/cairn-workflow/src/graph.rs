use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use cairn_unit::{FieldType, OutputSet};
use serde_json::Value;
use tracing::debug;

use crate::edge::Edge;
use crate::error::WorkflowError;
use crate::fanout::contains_error_marker;
use crate::node::NodeSpec;

/// The workflow DAG.
///
/// Built incrementally with [`Graph::add_node`] and [`Graph::connect`]; every
/// mutation that would break acyclicity or typing is rejected and leaves the
/// graph as it was.
#[derive(Debug, Clone, Default)]
pub struct Graph {
  nodes: Vec<NodeSpec>,
  index: HashMap<String, usize>,
  edges: Vec<Edge>,
  /// Adjacency list: node_id -> list of downstream node_ids.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: node_id -> list of upstream node_ids.
  reverse_adjacency: HashMap<String, Vec<String>>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_node(&mut self, spec: NodeSpec) -> Result<(), WorkflowError> {
    if !is_valid_id(&spec.id) {
      return Err(WorkflowError::InvalidNodeId(spec.id));
    }
    if self.index.contains_key(&spec.id) {
      return Err(WorkflowError::DuplicateNode(spec.id));
    }
    self.adjacency.insert(spec.id.clone(), Vec::new());
    self.reverse_adjacency.insert(spec.id.clone(), Vec::new());
    self.index.insert(spec.id.clone(), self.nodes.len());
    self.nodes.push(spec);
    Ok(())
  }

  pub fn connect(
    &mut self,
    from: &str,
    output: &str,
    to: &str,
    input: &str,
  ) -> Result<(), WorkflowError> {
    self.connect_edge(Edge::new(from, output, to, input))
  }

  pub fn connect_edge(&mut self, edge: Edge) -> Result<(), WorkflowError> {
    let dest = self.require(&edge.to)?;
    self.require(&edge.from)?;

    if edge.from == edge.to || self.reaches(&edge.to, &edge.from) {
      return Err(WorkflowError::Cycle {
        from: edge.from.clone(),
        to: edge.to.clone(),
      });
    }

    if self
      .edges
      .iter()
      .any(|e| e.to == edge.to && e.input == edge.input)
      || dest.iterables.contains(&edge.input)
    {
      return Err(WorkflowError::AlreadyBound {
        node_id: edge.to.clone(),
        field: edge.input.clone(),
      });
    }

    self.check_edge_types(&edge)?;

    if edge.iterable && !self.is_fanned_out(&edge.to) {
      self.check_outgoing_with(&edge)?;
    }

    debug!(edge = %edge.label(), iterable = edge.iterable, "edge_connected");

    let downstream = self.adjacency.entry(edge.from.clone()).or_default();
    if !downstream.contains(&edge.to) {
      downstream.push(edge.to.clone());
    }
    let upstream = self.reverse_adjacency.entry(edge.to.clone()).or_default();
    if !upstream.contains(&edge.from) {
      upstream.push(edge.from.clone());
    }
    self.edges.push(edge);
    Ok(())
  }

  pub fn node(&self, node_id: &str) -> Option<&NodeSpec> {
    self.index.get(node_id).map(|&i| &self.nodes[i])
  }

  /// Nodes in insertion order.
  pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
    self.nodes.iter()
  }

  pub fn edges(&self) -> &[Edge] {
    &self.edges
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Get downstream nodes for a given node.
  pub fn downstream(&self, node_id: &str) -> &[String] {
    self
      .adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get upstream nodes for a given node.
  pub fn upstream(&self, node_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(node_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Edges into `node_id`, in connection order.
  pub fn incoming(&self, node_id: &str) -> impl Iterator<Item = &Edge> {
    self.edges.iter().filter(move |e| e.to == node_id)
  }

  /// Every node reachable downstream of `node_id`, in topological order.
  pub fn descendants(&self, node_id: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&str> = self.downstream(node_id).iter().map(String::as_str).collect();
    while let Some(id) = queue.pop_front() {
      if seen.insert(id.to_string()) {
        queue.extend(self.downstream(id).iter().map(String::as_str));
      }
    }
    self
      .topological_order()
      .into_iter()
      .filter(|id| seen.contains(id))
      .collect()
  }

  /// Whether the node runs as more than one instance.
  pub fn is_fanned_out(&self, node_id: &str) -> bool {
    self.node(node_id).is_some_and(|n| !n.iterables.is_empty())
      || self.incoming(node_id).any(|e| e.iterable)
  }

  /// Fields the node expands over: its own iterables in declaration order,
  /// then fields bound by iterable edges in connection order.
  pub fn iterable_fields(&self, node_id: &str) -> Vec<String> {
    let mut fields = self
      .node(node_id)
      .map(|n| n.iterables.clone())
      .unwrap_or_default();
    fields.extend(
      self
        .incoming(node_id)
        .filter(|e| e.iterable)
        .map(|e| e.input.clone()),
    );
    fields
  }

  /// Kahn's algorithm. Among nodes that are ready at the same time, the one
  /// added first comes first.
  pub fn topological_order(&self) -> Vec<String> {
    let mut in_degree: Vec<usize> = self
      .nodes
      .iter()
      .map(|n| self.upstream(&n.id).len())
      .collect();
    let mut ready: BTreeSet<usize> = in_degree
      .iter()
      .enumerate()
      .filter(|(_, d)| **d == 0)
      .map(|(i, _)| i)
      .collect();

    let mut order = Vec::with_capacity(self.nodes.len());
    while let Some(i) = ready.pop_first() {
      let id = &self.nodes[i].id;
      order.push(id.clone());
      for next in self.downstream(id) {
        let j = self.index[next];
        in_degree[j] -= 1;
        if in_degree[j] == 0 {
          ready.insert(j);
        }
      }
    }
    order
  }

  /// Check the whole graph before execution. Returns every problem found.
  pub fn validate(&self) -> Result<(), Vec<WorkflowError>> {
    let mut errors = Vec::new();

    for spec in &self.nodes {
      let unit = spec.unit.spec();
      let bound: HashSet<&str> = self.incoming(&spec.id).map(|e| e.input.as_str()).collect();

      for field in &spec.iterables {
        let Some(decl) = unit.input_field(field) else {
          errors.push(WorkflowError::UnknownInput {
            node_id: spec.id.clone(),
            field: field.clone(),
          });
          continue;
        };
        match spec.params.get(field) {
          Some(Value::Array(items)) => {
            let bad = items
              .iter()
              .filter(|v| !decl.field_type.matches(v))
              .map(|v| cairn_params::ValidationError::TypeMismatch {
                field: field.clone(),
                expected: decl.field_type.clone(),
                value: v.clone(),
              })
              .collect::<Vec<_>>();
            if !bad.is_empty() {
              errors.push(WorkflowError::Validation {
                node_id: spec.id.clone(),
                errors: bad,
              });
            }
          }
          _ => errors.push(WorkflowError::IterableNotList {
            node_id: spec.id.clone(),
            field: field.clone(),
          }),
        }
      }

      for field in spec.params.keys() {
        if bound.contains(field.as_str()) {
          errors.push(WorkflowError::AlreadyBound {
            node_id: spec.id.clone(),
            field: field.clone(),
          });
        }
      }

      let statics: BTreeMap<String, Value> = spec
        .params
        .iter()
        .filter(|(k, _)| !spec.iterables.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
      let violations = cairn_params::check(unit, &statics, |f| {
        bound.contains(f) || spec.iterables.iter().any(|i| i == f)
      });
      if !violations.is_empty() {
        errors.push(WorkflowError::Validation {
          node_id: spec.id.clone(),
          errors: violations,
        });
      }

      if self.nodes.len() > 1
        && !spec.isolated
        && self.upstream(&spec.id).is_empty()
        && self.downstream(&spec.id).is_empty()
      {
        errors.push(WorkflowError::DisconnectedNode(spec.id.clone()));
      }
    }

    for edge in &self.edges {
      if let Err(e) = self.check_edge_types(edge) {
        errors.push(e);
      }
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
  }

  /// Assemble the input values for `node_id` from its static parameters and
  /// the collected outputs of its upstream nodes.
  ///
  /// Iterable edges must carry a list. A non-iterable edge carrying a list
  /// with error markers fails with `UpstreamElementFailed`.
  pub fn bind_inputs(
    &self,
    node_id: &str,
    upstream: &HashMap<String, OutputSet>,
  ) -> Result<BTreeMap<String, Value>, WorkflowError> {
    let spec = self.require(node_id)?;
    let mut values = spec.params.clone();

    for edge in self.incoming(node_id) {
      let value = upstream
        .get(&edge.from)
        .and_then(|outputs| outputs.get(&edge.output))
        .ok_or_else(|| WorkflowError::UnknownOutput {
          node_id: edge.from.clone(),
          field: edge.output.clone(),
        })?;

      let value = match &edge.transform {
        Some(transform) => transform
          .apply(value)
          .map_err(|message| WorkflowError::Transform {
            edge: edge.label(),
            name: transform.name().to_string(),
            message,
          })?,
        None => value.clone(),
      };

      if edge.iterable {
        if !value.is_array() {
          return Err(WorkflowError::IterableNotList {
            node_id: node_id.to_string(),
            field: edge.input.clone(),
          });
        }
      } else if contains_error_marker(&value) {
        return Err(WorkflowError::UpstreamElementFailed {
          node_id: node_id.to_string(),
          field: edge.input.clone(),
        });
      }

      values.insert(edge.input.clone(), value);
    }

    Ok(values)
  }

  fn require(&self, node_id: &str) -> Result<&NodeSpec, WorkflowError> {
    self
      .node(node_id)
      .ok_or_else(|| WorkflowError::UnknownNode(node_id.to_string()))
  }

  /// Type carried by an edge before it reaches the destination field.
  fn carried_type(&self, edge: &Edge) -> Result<FieldType, WorkflowError> {
    let source = self.require(&edge.from)?;
    let output = source
      .unit
      .spec()
      .output_field(&edge.output)
      .ok_or_else(|| WorkflowError::UnknownOutput {
        node_id: edge.from.clone(),
        field: edge.output.clone(),
      })?;

    let produced = if self.is_fanned_out(&edge.from) {
      FieldType::list_of(output.field_type.clone())
    } else {
      output.field_type.clone()
    };
    Ok(
      edge
        .transform
        .as_ref()
        .and_then(|t| t.output_type().cloned())
        .unwrap_or(produced),
    )
  }

  fn check_edge_types(&self, edge: &Edge) -> Result<(), WorkflowError> {
    let dest = self.require(&edge.to)?;
    let input = dest
      .unit
      .spec()
      .input_field(&edge.input)
      .ok_or_else(|| WorkflowError::UnknownInput {
        node_id: edge.to.clone(),
        field: edge.input.clone(),
      })?;
    let carried = self.carried_type(edge)?;

    let found = if edge.iterable {
      match carried.element() {
        Some(element) => element.clone(),
        None => {
          return Err(WorkflowError::IterableNotList {
            node_id: edge.to.clone(),
            field: edge.input.clone(),
          });
        }
      }
    } else {
      carried
    };

    if input.field_type.accepts(&found) {
      Ok(())
    } else {
      Err(WorkflowError::TypeMismatch {
        edge: edge.label(),
        expected: input.field_type.clone(),
        found,
      })
    }
  }

  /// Whether `to` is reachable from `from` along existing edges.
  /// Re-check the edges leaving `edge.to` as if `edge` were connected. An
  /// iterable edge fans its destination out, so those edges start carrying
  /// lists.
  fn check_outgoing_with(&mut self, edge: &Edge) -> Result<(), WorkflowError> {
    let outgoing: Vec<Edge> = self
      .edges
      .iter()
      .filter(|e| e.from == edge.to)
      .cloned()
      .collect();
    if outgoing.is_empty() {
      return Ok(());
    }
    self.edges.push(edge.clone());
    let result = outgoing.iter().try_for_each(|out| self.check_edge_types(out));
    self.edges.pop();
    result
  }

  fn reaches(&self, from: &str, to: &str) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
      if id == to {
        return true;
      }
      if seen.insert(id) {
        stack.extend(self.downstream(id).iter().map(String::as_str));
      }
    }
    false
  }
}

fn is_valid_id(id: &str) -> bool {
  !id.is_empty()
    && id
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
