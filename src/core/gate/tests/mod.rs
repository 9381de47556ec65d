mod plan_mode;
