//! ABI bindings of the deployed GovFund contract.

use alloy_sol_types::sol;

sol! {
    #[sol(all_derives)]
    #[derive(Debug)]
    interface IGovFund {
        function getProjectCount() external view returns (uint256);
        function getProjectDetails(uint256 projectId) external view returns (
            string projectName,
            string projectDetails,
            string contractorName,
            address contractor,
            uint256 startingDate,
            uint256 projectBudget,
            bool isActive
        );
        function contractorWorkDone(uint256 projectId, address contractor) external view returns (bool);
        function governmentApproved(uint256 projectId, address contractor) external view returns (bool);
        function getContractorBalance(uint256 projectId) external view returns (uint256);
        function getContractBalance() external view returns (uint256);
        function government() external view returns (address);

        function createProject(
            string projectName,
            string projectDetails,
            string contractorName,
            address contractor,
            uint256 projectBudget
        ) external;
        function depositFunds() external payable;
        function withdrawFunds(uint256 amount) external;
        function contractorWorkDoneConfirmation(uint256 projectId) external;
        function governmentApproveWork(uint256 projectId) external;
        function sendFundsToContractor(uint256 projectId, uint256 amount) external;
    }
}
