/*!
# DomeWatch DevKit - Simulateurs et utilitaires de test

Permet de tester le watchdog sans dôme, sans relais et sans réseau :
- drivers dôme / carte de relais simulés qui enregistrent chaque appel
- relais réseau simulé (API RPC) servi par wiremock
- sonde scriptée, contrôle de processus enregistreur
- harness qui câble un contexte complet sur des répertoires temporaires
*/

pub mod driver_stub;
pub mod power_stub;
pub mod test_utils;

pub use driver_stub::{SimSwitch, SimulatedDevices};
pub use power_stub::{PowerCall, PowerSwitchStub};
pub use test_utils::{CountingRecoveryHandler, RecordingProcessControl, ScriptedProbe, TestHarness};
