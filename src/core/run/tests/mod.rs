mod outcome;
mod state_machine;
