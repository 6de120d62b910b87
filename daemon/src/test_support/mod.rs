// Test-only doubles for the pipeline's external collaborators (spec §8),
// grounded in the teacher's in-process test harness pattern
// (`tos-testing-framework`) of standing real infrastructure up with an
// in-memory substitute rather than mocking individual calls.

#[cfg(test)]
pub mod fakes;
