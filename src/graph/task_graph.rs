//! 任务图
//!
//! 按插入顺序保存任务；merge 把一轮计划增量校验后并入图中：
//! 计划内 ID 与已有任务冲突时分配新 ID（node_xxxxxxxx）并记录 remap，依赖与参数中的占位符按 remap 改写；
//! 校验（工具名、重复 ID、自依赖、未知依赖、环）任一失败则整个增量被拒绝，图保持不变。
//! 环检测用入度表（Kahn）做拓扑排序。

use std::collections::{HashMap, HashSet, VecDeque};

use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::graph::types::*;
use crate::plan::{referenced_nodes, rewrite_node_ids, PlanIncrement};

/// 一次合并的结果
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MergeReport {
    /// 新增任务的最终ID（按计划顺序）
    pub added: Vec<TaskId>,
    /// 冲突后重新分配的ID：计划内ID -> 新ID
    pub remapped: Vec<(TaskId, TaskId)>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
}

impl Serialize for TaskGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// 按插入顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn ids(&self) -> &[TaskId] {
        &self.order
    }

    /// 直接插入任务，不做校验；ID 已存在时返回 false 且不覆盖
    pub fn insert(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        true
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Done => counts.done += 1,
                TaskStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// 任务ID -> 状态
    pub fn node_status(&self) -> Map<String, Value> {
        self.iter()
            .map(|t| (t.id.clone(), serde_json::to_value(t.status).unwrap_or(Value::Null)))
            .collect()
    }

    pub fn has_pending(&self) -> bool {
        self.tasks.values().any(|t| t.status == TaskStatus::Pending)
    }

    pub fn pending_ids(&self) -> Vec<TaskId> {
        self.iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }

    /// 所有 Done 任务的结果（占位符解析环境）
    pub fn done_results(&self) -> HashMap<TaskId, Value> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Done)
            .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
            .collect()
    }

    /// 所有已有结果的任务（写入每轮上下文的 node_results）
    pub fn node_results(&self) -> Map<String, Value> {
        self.iter()
            .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
            .collect()
    }

    /// Error 任务汇总：{id: {tool, args, error}}
    pub fn error_summary(&self) -> Map<String, Value> {
        self.iter()
            .filter(|t| t.status == TaskStatus::Error)
            .map(|t| {
                (
                    t.id.clone(),
                    serde_json::json!({
                        "tool": t.name,
                        "args": t.args,
                        "error": t.error,
                    }),
                )
            })
            .collect()
    }

    /// Pending 任务中，存在依赖为 Error 的任务ID
    pub fn failed_dependency_ids(&self) -> Vec<TaskId> {
        self.iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on.iter().any(|d| {
                    self.tasks
                        .get(d)
                        .is_some_and(|dep| dep.status == TaskStatus::Error)
                })
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// 就绪任务：Pending 且所有依赖均为 Done（依赖不存在视为未满足），按插入顺序
    pub fn ready_ids(&self) -> Vec<TaskId> {
        self.iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| {
                t.depends_on.iter().all(|d| {
                    self.tasks
                        .get(d)
                        .is_some_and(|dep| dep.status == TaskStatus::Done)
                })
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// 校验计划增量；is_known_tool 判断工具名是否在可用工具集中
    pub fn validate_increment(
        &self,
        increment: &PlanIncrement,
        is_known_tool: impl Fn(&str) -> bool,
    ) -> Result<(), GraphError> {
        let mut local_ids: HashSet<&str> = HashSet::new();
        for call in &increment.tool_calls {
            if call.id.trim().is_empty() {
                return Err(GraphError::EmptyId);
            }
            if !local_ids.insert(call.id.as_str()) {
                return Err(GraphError::DuplicateId(call.id.clone()));
            }
            if !is_known_tool(&call.name) {
                return Err(GraphError::UnknownTool {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
            }
        }

        for call in &increment.tool_calls {
            for dep in &call.depends_on {
                if dep == &call.id {
                    return Err(GraphError::SelfDependency(call.id.clone()));
                }
                if !local_ids.contains(dep.as_str()) && !self.contains(dep) {
                    return Err(GraphError::UnknownDependency {
                        id: call.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // 新任务之间的依赖（已有任务不会依赖新任务）
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for call in &increment.tool_calls {
            in_degree.entry(call.id.as_str()).or_insert(0);
            for dep in call.depends_on.iter().filter(|d| local_ids.contains(d.as_str())) {
                adjacency.entry(dep.as_str()).or_default().push(call.id.as_str());
                *in_degree.entry(call.id.as_str()).or_insert(0) += 1;
            }
        }
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in adjacency.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(next) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }
        if visited < in_degree.len() {
            let cyclic: Vec<TaskId> = increment
                .tool_calls
                .iter()
                .filter(|c| in_degree.get(c.id.as_str()).is_some_and(|d| *d > 0))
                .map(|c| c.id.clone())
                .collect();
            return Err(GraphError::Cycle(cyclic));
        }

        Ok(())
    }

    /// 校验并合并计划增量；失败时图不变
    pub fn merge(
        &mut self,
        increment: &PlanIncrement,
        is_known_tool: impl Fn(&str) -> bool,
    ) -> Result<MergeReport, GraphError> {
        self.validate_increment(increment, is_known_tool)?;

        let local_ids: HashSet<&str> = increment.tool_calls.iter().map(|c| c.id.as_str()).collect();
        let mut remap: HashMap<TaskId, TaskId> = HashMap::new();
        let mut minted: HashSet<TaskId> = HashSet::new();
        let mut report = MergeReport::default();

        for call in &increment.tool_calls {
            if self.contains(&call.id) {
                let fresh = loop {
                    let candidate = mint_node_id();
                    if !self.contains(&candidate)
                        && !minted.contains(&candidate)
                        && !local_ids.contains(candidate.as_str())
                    {
                        break candidate;
                    }
                };
                minted.insert(fresh.clone());
                report.remapped.push((call.id.clone(), fresh.clone()));
                remap.insert(call.id.clone(), fresh);
            }
        }

        for call in &increment.tool_calls {
            let id = remap.get(&call.id).cloned().unwrap_or_else(|| call.id.clone());
            let depends_on: Vec<TaskId> = call
                .depends_on
                .iter()
                .map(|d| remap.get(d).cloned().unwrap_or_else(|| d.clone()))
                .collect();
            let args = if remap.is_empty() {
                call.args.clone()
            } else {
                match rewrite_node_ids(&Value::Object(call.args.clone()), &remap) {
                    Value::Object(map) => map,
                    _ => call.args.clone(),
                }
            };

            let undeclared: Vec<String> = referenced_nodes(&Value::Object(args.clone()))
                .into_iter()
                .filter(|r| !depends_on.contains(r))
                .collect();
            if !undeclared.is_empty() {
                tracing::warn!(task = %id, ?undeclared, "placeholder references a task not listed in depends_on");
            }

            if self.insert(Task::new(id.clone(), call.name.clone(), args, depends_on)) {
                report.added.push(id);
            } else {
                tracing::debug!(task = %id, "task already present, merge is a no-op");
            }
        }

        tracing::debug!(added = report.added.len(), remapped = report.remapped.len(), "plan increment merged");
        Ok(report)
    }
}

fn mint_node_id() -> TaskId {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("node_{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::parse_increment;

    fn known(name: &str) -> bool {
        matches!(name, "add_a_b" | "web_search")
    }

    fn inc(raw: &str) -> PlanIncrement {
        parse_increment(raw).unwrap()
    }

    #[test]
    fn test_merge_keeps_plan_ids_and_order() {
        let mut graph = TaskGraph::new();
        let report = graph
            .merge(
                &inc(r#"{"tool_calls":[
                    {"id":"b","name":"add_a_b","args":{"a":1,"b":2}},
                    {"id":"a","name":"add_a_b","args":{"a":3,"b":4},"depends_on":["b"]}
                ]}"#),
                known,
            )
            .unwrap();
        assert_eq!(report.added, vec!["b".to_string(), "a".to_string()]);
        assert!(report.remapped.is_empty());
        assert_eq!(graph.ids(), &["b".to_string(), "a".to_string()]);
        assert_eq!(graph.get("a").unwrap().depends_on, vec!["b".to_string()]);
        assert_eq!(graph.status_counts().pending, 2);
    }

    #[test]
    fn test_colliding_ids_are_remapped_with_deps_and_placeholders() {
        let mut graph = TaskGraph::new();
        graph
            .merge(&inc(r#"{"tool_calls":[{"id":"s1","name":"add_a_b","args":{"a":1,"b":1}}]}"#), known)
            .unwrap();

        let report = graph
            .merge(
                &inc(r#"{"tool_calls":[
                    {"id":"s1","name":"add_a_b","args":{"a":2,"b":3}},
                    {"id":"s2","name":"add_a_b","args":{"a":"${node:s1.sum}","b":1},"depends_on":["s1"]}
                ]}"#),
                known,
            )
            .unwrap();

        assert_eq!(report.remapped.len(), 1);
        let (from, to) = &report.remapped[0];
        assert_eq!(from, "s1");
        assert!(to.starts_with("node_") && to.len() == 13);
        assert_eq!(graph.len(), 3);

        let s2 = graph.get("s2").unwrap();
        assert_eq!(s2.depends_on, vec![to.clone()]);
        assert_eq!(s2.args["a"], Value::String(format!("${{node:{to}.sum}}")));
        // 原任务不受影响
        assert_eq!(graph.get("s1").unwrap().args["a"], serde_json::json!(1));
    }

    #[test]
    fn test_two_collisions_in_one_increment_get_distinct_fresh_ids() {
        let mut graph = TaskGraph::new();
        graph
            .merge(
                &inc(r#"{"tool_calls":[
                    {"id":"s1","name":"add_a_b","args":{"a":1,"b":1}},
                    {"id":"s2","name":"add_a_b","args":{"a":2,"b":2}}
                ]}"#),
                known,
            )
            .unwrap();

        let report = graph
            .merge(
                &inc(r#"{"tool_calls":[
                    {"id":"s1","name":"add_a_b","args":{"a":3,"b":3}},
                    {"id":"s2","name":"add_a_b","args":{"a":"${node:s1.sum}","b":4},"depends_on":["s1"]}
                ]}"#),
                known,
            )
            .unwrap();

        assert_eq!(report.remapped.len(), 2);
        let fresh_s1 = &report.remapped[0].1;
        let fresh_s2 = &report.remapped[1].1;
        assert_ne!(fresh_s1, fresh_s2);
        for fresh in [fresh_s1, fresh_s2] {
            assert!(fresh.starts_with("node_"));
            assert_ne!(fresh, "s1");
            assert_ne!(fresh, "s2");
        }
        assert_eq!(report.added, vec![fresh_s1.clone(), fresh_s2.clone()]);
        assert_eq!(graph.len(), 4);

        let new_s2 = graph.get(fresh_s2).unwrap();
        assert_eq!(new_s2.depends_on, vec![fresh_s1.clone()]);
        assert_eq!(new_s2.args["a"], Value::String(format!("${{node:{fresh_s1}.sum}}")));
        assert!(graph.get("s2").unwrap().depends_on.is_empty());
    }

    #[test]
    fn test_same_plan_id_in_two_rounds_yields_distinct_tasks() {
        let mut graph = TaskGraph::new();
        let raw = r#"{"tool_calls":[{"id":"x","name":"add_a_b","args":{"a":1,"b":1}}]}"#;
        for _ in 0..4 {
            graph.merge(&inc(raw), known).unwrap();
        }
        let ids: HashSet<&TaskId> = graph.ids().iter().collect();
        assert_eq!(graph.len(), 4);
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_dependency_on_existing_task_is_kept() {
        let mut graph = TaskGraph::new();
        graph
            .merge(&inc(r#"{"tool_calls":[{"id":"s1","name":"add_a_b","args":{"a":1,"b":1}}]}"#), known)
            .unwrap();
        graph
            .merge(
                &inc(r#"{"tool_calls":[{"id":"s2","name":"add_a_b","args":{"a":"${node:s1.sum}","b":1},"depends_on":["s1"]}]}"#),
                known,
            )
            .unwrap();
        assert_eq!(graph.get("s2").unwrap().depends_on, vec!["s1".to_string()]);
    }

    #[test]
    fn test_validation_rejects_whole_increment() {
        let mut graph = TaskGraph::new();
        let cases = [
            (
                r#"{"tool_calls":[{"id":"a","name":"add_a_b","args":{}},{"id":"b","name":"rm_rf","args":{}}]}"#,
                GraphError::UnknownTool { id: "b".into(), name: "rm_rf".into() },
            ),
            (
                r#"{"tool_calls":[{"id":"a","name":"add_a_b","args":{}},{"id":"a","name":"add_a_b","args":{}}]}"#,
                GraphError::DuplicateId("a".into()),
            ),
            (
                r#"{"tool_calls":[{"id":"a","name":"add_a_b","args":{},"depends_on":["a"]}]}"#,
                GraphError::SelfDependency("a".into()),
            ),
            (
                r#"{"tool_calls":[{"id":"a","name":"add_a_b","args":{},"depends_on":["ghost"]}]}"#,
                GraphError::UnknownDependency { id: "a".into(), dependency: "ghost".into() },
            ),
            (
                r#"{"tool_calls":[{"id":"","name":"add_a_b","args":{}}]}"#,
                GraphError::EmptyId,
            ),
        ];
        for (raw, expected) in cases {
            assert_eq!(graph.merge(&inc(raw), known).unwrap_err(), expected);
            assert!(graph.is_empty(), "graph must stay unchanged for {raw}");
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = TaskGraph::new();
        let err = graph
            .merge(
                &inc(r#"{"tool_calls":[
                    {"id":"ok","name":"add_a_b","args":{}},
                    {"id":"a","name":"add_a_b","args":{},"depends_on":["b","ok"]},
                    {"id":"b","name":"add_a_b","args":{},"depends_on":["a"]}
                ]}"#),
                known,
            )
            .unwrap_err();
        assert_eq!(err, GraphError::Cycle(vec!["a".into(), "b".into()]));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_ready_and_failed_dependency_queries() {
        let mut graph = TaskGraph::new();
        graph.insert(Task::new("a", "add_a_b", Map::new(), vec![]));
        graph.insert(Task::new("b", "add_a_b", Map::new(), vec!["a".into()]));
        graph.insert(Task::new("c", "add_a_b", Map::new(), vec!["missing".into()]));
        assert!(!graph.insert(Task::new("a", "web_search", Map::new(), vec![])));

        assert_eq!(graph.ready_ids(), vec!["a".to_string()]);

        let a = graph.get_mut("a").unwrap();
        a.mark_running();
        a.fail("boom");
        assert_eq!(graph.failed_dependency_ids(), vec!["b".to_string()]);
        assert!(graph.ready_ids().is_empty());

        let summary = graph.error_summary();
        assert_eq!(summary["a"]["tool"], "add_a_b");
        assert_eq!(summary["a"]["error"], "boom");
    }

    #[test]
    fn test_serializes_in_insertion_order() {
        let mut graph = TaskGraph::new();
        graph.insert(Task::new("z", "add_a_b", Map::new(), vec![]));
        graph.insert(Task::new("a", "add_a_b", Map::new(), vec![]));
        let value = serde_json::to_value(&graph).unwrap();
        assert_eq!(value[0]["id"], "z");
        assert_eq!(value[1]["id"], "a");
        assert_eq!(value[1]["status"], "pending");
    }
}
