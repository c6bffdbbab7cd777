// microlink-mcs: Workspace root.
//
// The real code lives in crates/ (wire contracts, test fakes) and
// services/ (adapters, edge orchestrator, ingestor, alarm engine).  This
// package exists to host the cross-service integration suites under
// tests/integration/.
