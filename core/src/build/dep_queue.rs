use std::{
  collections::{HashMap, HashSet},
  hash::Hash,
};

/// Jobs waiting on other jobs. A job becomes ready once every job it
/// depends on has been [`finish`](DependencyQueue::finish)ed.
#[derive(Debug)]
pub struct DependencyQueue<N: Hash + Eq, V> {
  dep_map: HashMap<N, (HashSet<N>, V)>,
  reverse_dep_map: HashMap<N, HashSet<N>>,
  priority: HashMap<N, usize>,
}

impl<N: Hash + Eq, V> Default for DependencyQueue<N, V> {
  fn default() -> Self {
    Self {
      dep_map: HashMap::new(),
      reverse_dep_map: HashMap::new(),
      priority: HashMap::new(),
    }
  }
}

impl<N: Hash + Eq + Clone + Ord, V> DependencyQueue<N, V> {
  pub fn contains(&self, key: &N) -> bool {
    self.dep_map.contains_key(key)
  }

  pub fn get(&self, key: &N) -> Option<&V> {
    self.dep_map.get(key).map(|(_, v)| v)
  }

  /// Adds a job. Dependencies that are never enqueued themselves count as
  /// already satisfied.
  pub fn enqueue(&mut self, key: N, value: V, dependencies: impl IntoIterator<Item = N>) {
    let mut deps = HashSet::new();
    for dep in dependencies {
      self
        .reverse_dep_map
        .entry(dep.clone())
        .or_insert_with(HashSet::new)
        .insert(key.clone());
      deps.insert(dep);
    }
    self.dep_map.insert(key, (deps, value));
  }

  /// Call once every job is enqueued. Drops dependencies on jobs that were
  /// never enqueued, ranks jobs by how much waits on them, and fails with
  /// the offending path if the jobs depend on each other in a circle.
  pub fn queue_finished(&mut self) -> Result<(), Vec<N>> {
    let known: HashSet<N> = self.dep_map.keys().cloned().collect();
    for (deps, _) in self.dep_map.values_mut() {
      deps.retain(|d| known.contains(d));
    }

    let mut keys: Vec<N> = known.into_iter().collect();
    keys.sort();

    let mut done = HashSet::new();
    for key in &keys {
      let mut stack = vec![];
      self.find_cycle(key, &mut stack, &mut done)?;
    }

    let mut dependents = HashMap::new();
    for key in &keys {
      count_dependents(key, &self.reverse_dep_map, &mut dependents);
    }
    self.priority = dependents
      .into_iter()
      .map(|(n, set)| (n, set.len()))
      .collect();
    Ok(())
  }

  fn find_cycle(&self, key: &N, stack: &mut Vec<N>, done: &mut HashSet<N>) -> Result<(), Vec<N>> {
    if done.contains(key) {
      return Ok(());
    }
    if let Some(start) = stack.iter().position(|k| k == key) {
      let mut cycle = stack[start..].to_vec();
      cycle.push(key.clone());
      return Err(cycle);
    }
    stack.push(key.clone());
    if let Some((deps, _)) = self.dep_map.get(key) {
      let mut deps: Vec<&N> = deps.iter().collect();
      deps.sort();
      for dep in deps {
        self.find_cycle(dep, stack, done)?;
      }
    }
    stack.pop();
    done.insert(key.clone());
    Ok(())
  }

  /// The ready job that unblocks the most other jobs.
  pub fn dequeue(&mut self) -> Option<(N, V)> {
    let key = self
      .dep_map
      .iter()
      .filter(|(_, (deps, _))| deps.is_empty())
      .map(|(key, _)| key)
      .max_by(|a, b| {
        let pa = self.priority.get(*a).copied().unwrap_or(0);
        let pb = self.priority.get(*b).copied().unwrap_or(0);
        // ties go to the smallest key so the order is reproducible
        pa.cmp(&pb).then_with(|| b.cmp(a))
      })?
      .clone();
    let (_, value) = self.dep_map.remove(&key)?;
    Some((key, value))
  }

  pub fn is_empty(&self) -> bool {
    self.dep_map.is_empty()
  }

  pub fn len(&self) -> usize {
    self.dep_map.len()
  }

  /// Marks `node` as done; returns the jobs that became ready.
  pub fn finish(&mut self, node: &N) -> Vec<N> {
    let mut ready = vec![];
    if let Some(dependents) = self.reverse_dep_map.remove(node) {
      for dep in dependents {
        if let Some((edges, _)) = self.dep_map.get_mut(&dep) {
          edges.remove(node);
          if edges.is_empty() {
            ready.push(dep);
          }
        }
      }
    }
    ready
  }
}

fn count_dependents<N: Hash + Eq + Clone>(
  key: &N,
  map: &HashMap<N, HashSet<N>>,
  results: &mut HashMap<N, HashSet<N>>,
) -> HashSet<N> {
  if let Some(set) = results.get(key) {
    return set.clone();
  }
  let mut set = HashSet::new();
  set.insert(key.clone());
  for dep in map.get(key).into_iter().flatten() {
    set.extend(count_dependents(dep, map, results));
  }
  results.insert(key.clone(), set.clone());
  set
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dependencies_come_first() {
    let mut q = DependencyQueue::default();
    q.enqueue("app", (), vec!["lib", "tool"]);
    q.enqueue("lib", (), vec!["libc"]);
    q.enqueue("tool", (), vec![]);
    q.enqueue("libc", (), vec![]);
    q.queue_finished().unwrap();

    // libc unblocks more than tool does
    assert_eq!(q.dequeue().map(|x| x.0), Some("libc"));
    assert_eq!(q.dequeue().map(|x| x.0), Some("tool"));
    assert_eq!(q.dequeue(), None);

    assert_eq!(q.finish(&"libc"), vec!["lib"]);
    assert_eq!(q.dequeue().map(|x| x.0), Some("lib"));
    assert!(q.finish(&"tool").is_empty());
    assert_eq!(q.finish(&"lib"), vec!["app"]);
    assert_eq!(q.dequeue().map(|x| x.0), Some("app"));
    assert!(q.is_empty());
  }

  #[test]
  fn test_missing_dependencies_are_satisfied() {
    let mut q = DependencyQueue::default();
    q.enqueue("app", 1, vec!["already-built"]);
    q.queue_finished().unwrap();
    assert_eq!(q.len(), 1);
    assert_eq!(q.dequeue(), Some(("app", 1)));
  }

  #[test]
  fn test_cycles_are_reported() {
    let mut q = DependencyQueue::default();
    q.enqueue("a", (), vec!["b"]);
    q.enqueue("b", (), vec!["c"]);
    q.enqueue("c", (), vec!["a"]);
    q.enqueue("d", (), vec![]);
    assert_eq!(q.queue_finished(), Err(vec!["a", "b", "c", "a"]));
  }
}
