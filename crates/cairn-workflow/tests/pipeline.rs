use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cairn_unit::{FieldType, InputField, OutputSet, ParameterSet, RunContext, UnitError, UnitOfWork, UnitSpec};
use cairn_workflow::{Edge, EdgeTransform, FanOutPolicy, Graph, NodeSpec, NodeState, fanout};
use serde_json::{Value, json};

struct Decl(UnitSpec);

#[async_trait]
impl UnitOfWork for Decl {
  fn spec(&self) -> &UnitSpec {
    &self.0
  }

  async fn run(&self, _: &ParameterSet, _: &RunContext) -> Result<OutputSet, UnitError> {
    Err(UnitError::failed("not runnable"))
  }
}

fn unit(name: &str, input: (&str, FieldType), output: (&str, FieldType)) -> Arc<dyn UnitOfWork> {
  Arc::new(Decl(
    UnitSpec::new(name)
      .input(InputField::required(input.0, input.1))
      .output(output.0, output.1),
  ))
}

/// Walk a two-stage graph by hand: expand, complete, collect, bind, expand.
#[test]
fn test_two_stage_fan_out_walk() {
  let work = tempfile::tempdir().unwrap();
  let mut graph = Graph::new();
  graph
    .add_node(
      NodeSpec::new("scale", unit("scale", ("factor", FieldType::Integer), ("value", FieldType::Integer)))
        .iterate("factor", vec![json!(2), json!(3)]),
    )
    .unwrap();
  graph
    .add_node(NodeSpec::new(
      "report",
      unit("report", ("total", FieldType::Integer), ("text", FieldType::String)),
    ))
    .unwrap();

  let sum = EdgeTransform::new("sum", |v: &Value| {
    v.as_array()
      .map(|items| json!(items.iter().filter_map(Value::as_i64).sum::<i64>()))
      .ok_or_else(|| "expected a list".to_string())
  })
  .with_output_type(FieldType::Integer);
  graph
    .connect_edge(Edge::new("scale", "value", "report", "total").with_transform(sum))
    .unwrap();

  graph.validate().unwrap();
  assert_eq!(graph.topological_order(), ["scale", "report"]);
  assert!(graph.is_fanned_out("scale"));
  assert!(!graph.is_fanned_out("report"));

  let spec = graph.node("scale").unwrap();
  let bound = graph.bind_inputs("scale", &HashMap::new()).unwrap();
  let mut instances = fanout::expand(spec, &bound, &graph.iterable_fields("scale"), work.path()).unwrap();
  assert_eq!(instances.len(), 2);
  assert_ne!(instances[0].fingerprint, instances[1].fingerprint);

  for node in &mut instances {
    let factor = node.params.get("factor").and_then(Value::as_i64).unwrap();
    node.transition(NodeState::Ready).unwrap();
    node.transition(NodeState::Running).unwrap();
    node
      .complete(OutputSet::from([("value".to_string(), json!(factor * 10))]))
      .unwrap();
  }
  let collected = fanout::collect(spec, &instances, FanOutPolicy::FailAll).unwrap();
  assert_eq!(collected["value"], json!([20, 30]));

  let upstream = HashMap::from([("scale".to_string(), collected)]);
  let bound = graph.bind_inputs("report", &upstream).unwrap();
  assert_eq!(bound["total"], json!(50));

  let report = graph.node("report").unwrap();
  let instances = fanout::expand(report, &bound, &graph.iterable_fields("report"), work.path()).unwrap();
  assert_eq!(instances.len(), 1);
  assert_eq!(instances[0].id, "report");
  assert_eq!(instances[0].workdir, work.path().join("report"));
  assert!(instances[0].fingerprint.is_some());
}

#[test]
fn test_failed_connect_keeps_graph_usable() {
  let mut graph = Graph::new();
  for id in ["a", "b", "c"] {
    graph
      .add_node(NodeSpec::new(id, unit(id, ("x", FieldType::Number), ("y", FieldType::Integer))))
      .unwrap();
  }
  graph.connect("a", "y", "b", "x").unwrap();
  graph.connect("b", "y", "c", "x").unwrap();

  assert!(graph.connect("c", "y", "a", "x").is_err());
  assert_eq!(graph.edges().len(), 2);
  assert!(graph.upstream("a").is_empty());
  assert_eq!(graph.descendants("a"), ["b", "c"]);
  assert_eq!(graph.topological_order(), ["a", "b", "c"]);
}
