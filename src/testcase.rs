/// Registry of property, assertion and optimization test cases
use serde::Serialize;

use crate::abi::{AbiFunction, AbiType, ContractAbi};
use crate::sequence::CallSequence;
use crate::types::{EVMAddress, EVMU256};

const OPTIMIZE_PREFIX: &str = "optimize_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestCaseKind {
    Property,
    Assertion,
    Optimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestCaseStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
}

/// Identity of a case: the deployed contract and the method under test.
pub type TestCaseId = (EVMAddress, [u8; 4]);

#[derive(Debug, Clone)]
pub struct TestCase {
    pub contract: EVMAddress,
    pub contract_name: String,
    pub function: AbiFunction,
    pub kind: TestCaseKind,
    pub status: TestCaseStatus,
    /// minimized reproducer, present when status is Failed
    pub witness: Option<CallSequence>,
    pub message: Option<String>,
    /// best observed value for optimization cases
    pub best_value: Option<EVMU256>,
}

impl TestCase {
    pub fn id(&self) -> TestCaseId {
        (self.contract, self.function.selector)
    }
}

/// One case is registered per matching method on each deployed target.
/// Workers share one registry behind the supervisor's lock; registration
/// is idempotent so identical replicas don't duplicate cases.
#[derive(Debug, Default)]
pub struct TestCaseRegistry {
    cases: Vec<TestCase>,
    property_prefixes: Vec<String>,
}

impl TestCaseRegistry {
    pub fn new(property_prefixes: Vec<String>) -> Self {
        Self {
            cases: vec![],
            property_prefixes,
        }
    }

    fn classify(&self, function: &AbiFunction) -> Option<TestCaseKind> {
        let returns_bool = function.outputs == vec![AbiType::Bool];
        let returns_integer = matches!(
            function.outputs.as_slice(),
            [AbiType::Uint(_)] | [AbiType::Int(_)]
        );
        if function.is_view
            && returns_bool
            && self
                .property_prefixes
                .iter()
                .any(|prefix| function.name.starts_with(prefix))
        {
            return Some(TestCaseKind::Property);
        }
        if function.is_view && returns_integer && function.name.starts_with(OPTIMIZE_PREFIX) {
            return Some(TestCaseKind::Optimization);
        }
        if !function.is_view && function.outputs.is_empty() {
            return Some(TestCaseKind::Assertion);
        }
        None
    }

    /// Scan a deployed contract and register a case per matching method.
    pub fn register_contract(&mut self, address: EVMAddress, name: &str, abi: &ContractAbi) {
        for function in &abi.functions {
            let Some(kind) = self.classify(function) else {
                continue;
            };
            let id = (address, function.selector);
            if self.cases.iter().any(|c| c.id() == id) {
                continue;
            }
            self.cases.push(TestCase {
                contract: address,
                contract_name: name.to_string(),
                function: function.clone(),
                kind,
                status: TestCaseStatus::Pending,
                witness: None,
                message: None,
                best_value: None,
            });
        }
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn cases_with_status(&self, status: TestCaseStatus) -> Vec<&TestCase> {
        self.cases.iter().filter(|c| c.status == status).collect()
    }

    pub fn cases_of_kind(&self, kind: TestCaseKind) -> Vec<(TestCaseId, AbiFunction)> {
        self.cases
            .iter()
            .filter(|c| c.kind == kind)
            .map(|c| (c.id(), c.function.clone()))
            .collect()
    }

    /// Pending cases enter Running when the campaign starts exercising
    /// them.
    pub fn start_all(&mut self) {
        for case in &mut self.cases {
            if case.status == TestCaseStatus::Pending {
                case.status = TestCaseStatus::Running;
            }
        }
    }

    /// Record a failure with its minimized witness. The first failure for
    /// a case wins; later (possibly longer) witnesses are ignored.
    pub fn record_failure(&mut self, id: TestCaseId, witness: CallSequence, message: String) {
        if let Some(case) = self.cases.iter_mut().find(|c| c.id() == id) {
            if case.status != TestCaseStatus::Failed {
                case.status = TestCaseStatus::Failed;
                case.witness = Some(witness);
                case.message = Some(message);
            }
        }
    }

    pub fn record_optimization(&mut self, id: TestCaseId, value: EVMU256) {
        if let Some(case) = self.cases.iter_mut().find(|c| c.id() == id) {
            if case.best_value.map(|best| value > best).unwrap_or(true) {
                case.best_value = Some(value);
            }
        }
    }

    pub fn skip(&mut self, id: TestCaseId, reason: String) {
        if let Some(case) = self.cases.iter_mut().find(|c| c.id() == id) {
            if case.status == TestCaseStatus::Pending || case.status == TestCaseStatus::Running {
                case.status = TestCaseStatus::Skipped;
                case.message = Some(reason);
            }
        }
    }

    /// Running cases pass when the campaign ends without a failure.
    pub fn finish(&mut self) {
        for case in &mut self.cases {
            if case.status == TestCaseStatus::Running {
                case.status = TestCaseStatus::Passed;
            }
        }
    }

    pub fn any_failed(&self) -> bool {
        self.cases
            .iter()
            .any(|c| c.status == TestCaseStatus::Failed)
    }

    pub fn is_failed(&self, id: TestCaseId) -> bool {
        self.cases
            .iter()
            .any(|c| c.id() == id && c.status == TestCaseStatus::Failed)
    }
}
