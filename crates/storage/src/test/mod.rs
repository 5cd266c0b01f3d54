mod data_util_test;
